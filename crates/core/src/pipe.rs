//! Cross-thread command pipe.
//!
//! The client thread and the embedded server thread tick independently; all
//! calls between them cross through one of these pipes (one per direction).
//! Entries execute strictly in enqueue order on the receiving thread's pump,
//! so a shutdown request always runs before anything queued after it by the
//! same thread. Shutdown is coordinated by a distinguished terminate entry
//! followed by joining the thread.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use tracing::debug;

enum Entry<T> {
    Cmd(T),
    Terminate,
}

/// Sending half of a command pipe. Single producer.
pub struct PipeSender<T> {
    tx: Sender<Entry<T>>,
}

/// Receiving half of a command pipe. Single consumer.
pub struct PipeReceiver<T> {
    rx: Receiver<Entry<T>>,
    terminated: bool,
}

/// Outcome of one pump pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// Nothing was queued.
    Idle,
    /// This many commands executed.
    Ran(usize),
    /// The terminate entry was reached (or the sender is gone); the
    /// receiving thread should wind down. Commands queued after the
    /// terminate entry are never executed.
    Terminated,
}

/// Create a connected pipe pair.
pub fn channel<T>() -> (PipeSender<T>, PipeReceiver<T>) {
    let (tx, rx) = mpsc::channel();
    (
        PipeSender { tx },
        PipeReceiver {
            rx,
            terminated: false,
        },
    )
}

impl<T> PipeSender<T> {
    /// Queue a command. Returns `false` if the receiving thread is gone.
    pub fn send(&self, cmd: T) -> bool {
        self.tx.send(Entry::Cmd(cmd)).is_ok()
    }

    /// Queue the terminate entry. Returns `false` if the receiver is gone.
    pub fn terminate(&self) -> bool {
        self.tx.send(Entry::Terminate).is_ok()
    }
}

impl<T> PipeReceiver<T> {
    /// Drain every queued entry in order, invoking `handler` per command.
    ///
    /// Never blocks; intended to run once per tick of the receiving thread.
    pub fn pump(&mut self, mut handler: impl FnMut(T)) -> Pump {
        if self.terminated {
            return Pump::Terminated;
        }
        let mut ran = 0;
        loop {
            match self.rx.try_recv() {
                Ok(Entry::Cmd(cmd)) => {
                    handler(cmd);
                    ran += 1;
                }
                Ok(Entry::Terminate) => {
                    debug!(ran, "pipe terminated");
                    self.terminated = true;
                    return Pump::Terminated;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!(ran, "pipe sender gone, terminating");
                    self.terminated = true;
                    return Pump::Terminated;
                }
            }
        }
        if ran == 0 {
            Pump::Idle
        } else {
            Pump::Ran(ran)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_pump_preserves_enqueue_order() {
        let (tx, mut rx) = channel();
        for i in 0..100u32 {
            assert!(tx.send(i));
        }
        let mut seen = Vec::new();
        assert_eq!(rx.pump(|i| seen.push(i)), Pump::Ran(100));
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_terminate_cuts_off_later_commands() {
        let (tx, mut rx) = channel();
        tx.send(1u32);
        tx.terminate();
        tx.send(2u32);
        let mut seen = Vec::new();
        assert_eq!(rx.pump(|i| seen.push(i)), Pump::Terminated);
        assert_eq!(seen, vec![1]);
        // Subsequent pumps stay terminated and never run the trailing command.
        assert_eq!(rx.pump(|i| seen.push(i)), Pump::Terminated);
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn test_cross_thread_fifo() {
        let (tx, mut rx) = channel();
        let producer = thread::spawn(move || {
            for i in 0..1000u32 {
                tx.send(i);
            }
            tx.terminate();
        });
        let mut seen = Vec::new();
        loop {
            if rx.pump(|i| seen.push(i)) == Pump::Terminated {
                break;
            }
            thread::yield_now();
        }
        producer.join().expect("producer thread");
        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_idle_when_empty() {
        let (_tx, mut rx) = channel::<u32>();
        assert_eq!(rx.pump(|_| {}), Pump::Idle);
    }

    #[test]
    fn test_sender_drop_terminates() {
        let (tx, mut rx) = channel::<u32>();
        drop(tx);
        assert_eq!(rx.pump(|_| {}), Pump::Terminated);
    }
}
