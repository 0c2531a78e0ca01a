//! Fuzz-style property tests for the wire codecs
//!
//! These tests validate that parsers handle arbitrary and corrupted
//! network input gracefully without crashing.

use proptest::prelude::*;
use wiresync_net::entity::read_entity_header;
use wiresync_net::protocol::{FrameHeader, ServerData, ServerOp};
use wiresync_net::usercmd::UserCommand;
use wiresync_net::{
    loopback_pair, EntityState, GameStateBlock, Incoming, MessageReader, MessageWriter,
    NetChannel, PacketTransport, PlayerState,
};

fn arb_entity() -> impl Strategy<Value = EntityState> {
    (
        1u16..1024,
        any::<[i32; 3]>(),
        any::<[i16; 3]>(),
        any::<u16>(),
        any::<u16>(),
        any::<u32>(),
        any::<u16>(),
        any::<u8>(),
    )
        .prop_map(
            |(number, origin, angles, model_index, effects, effects32, frame, event)| {
                EntityState {
                    number,
                    origin,
                    angles,
                    model_index,
                    sound_index: effects,
                    effects: effects32,
                    owner: 0,
                    frame,
                    event,
                }
            },
        )
}

proptest! {
    /// Property: Arbitrary bytes don't crash the serverdata parser
    #[test]
    fn arbitrary_bytes_dont_crash_serverdata(
        random_bytes in prop::collection::vec(any::<u8>(), 0..2000),
    ) {
        let _result = ServerData::read(&mut MessageReader::new(&random_bytes));
        // No panic = success
    }

    /// Property: Arbitrary bytes don't crash the frame header parser
    #[test]
    fn arbitrary_bytes_dont_crash_frame_header(
        random_bytes in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let _result = FrameHeader::read(&mut MessageReader::new(&random_bytes));
    }

    /// Property: Arbitrary bytes don't crash the delta decoders
    #[test]
    fn arbitrary_bytes_dont_crash_deltas(
        random_bytes in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let mut r = MessageReader::new(&random_bytes);
        let _ = EntityState::read_delta(&EntityState::default(), &mut r);
        let mut r = MessageReader::new(&random_bytes);
        let _ = PlayerState::read_delta(&PlayerState::ZERO, &mut r);
        let mut r = MessageReader::new(&random_bytes);
        let _ = UserCommand::read_delta(&UserCommand::ZERO, &mut r);
        let mut r = MessageReader::new(&random_bytes);
        let _ = read_entity_header(&mut r);
    }

    /// Property: Arbitrary datagrams don't crash the netchannel
    #[test]
    fn arbitrary_datagrams_dont_crash_channel(
        random_bytes in prop::collection::vec(any::<u8>(), 0..1400),
    ) {
        let (near, far) = loopback_pair();
        let mut chan = NetChannel::new(near, false);
        far.send(&random_bytes).unwrap();
        let _result = chan.poll();
    }

    /// Property: Entity deltas roundtrip against any reference
    #[test]
    fn entity_delta_roundtrips(old in arb_entity(), new in arb_entity()) {
        let mut new = new;
        new.number = old.number;
        let mut w = MessageWriter::new();
        new.write_delta(&old, &mut w);
        let bytes = w.into_bytes();
        let decoded = EntityState::read_delta(&old, &mut MessageReader::new(&bytes)).unwrap();
        prop_assert_eq!(decoded, new);
    }

    /// Property: User command deltas roundtrip against any reference
    #[test]
    fn usercmd_delta_roundtrips(
        server_time in any::<i64>(),
        msec in any::<u8>(),
        buttons in any::<u16>(),
        angles in any::<[i16; 3]>(),
        axes in any::<[i8; 3]>(),
    ) {
        let cmd = UserCommand {
            server_time,
            msec,
            buttons: wiresync_net::usercmd::Buttons::from_bits_truncate(buttons),
            angles,
            forward: axes[0],
            side: axes[1],
            up: axes[2],
        };
        let mut w = MessageWriter::new();
        cmd.write_delta(&UserCommand::ZERO, &mut w);
        let bytes = w.into_bytes();
        let decoded = UserCommand::read_delta(&UserCommand::ZERO, &mut MessageReader::new(&bytes)).unwrap();
        prop_assert_eq!(decoded, cmd);
    }

    /// Property: Game state deltas roundtrip
    #[test]
    fn game_state_delta_roundtrips(
        phase in any::<u8>(),
        phase_start in any::<i64>(),
        phase_duration in any::<i64>(),
        flags in any::<u16>(),
    ) {
        let state = GameStateBlock { phase, phase_start, phase_duration, flags };
        let mut w = MessageWriter::new();
        state.write_delta(&GameStateBlock::ZERO, &mut w);
        let bytes = w.into_bytes();
        let decoded =
            GameStateBlock::read_delta(&GameStateBlock::ZERO, &mut MessageReader::new(&bytes)).unwrap();
        prop_assert_eq!(decoded, state);
    }

    /// Property: Messages survive the channel whatever their size
    #[test]
    fn channel_delivers_any_size(len in 0usize..10_000) {
        let (near, far) = loopback_pair();
        let mut tx = NetChannel::new(near, true);
        let mut rx = NetChannel::new(far, true);
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        tx.send_message(&payload).unwrap();
        let mut delivered = None;
        while let Some(incoming) = rx.poll().unwrap() {
            if let Incoming::Message(data) = incoming {
                delivered = Some(data);
            }
        }
        prop_assert_eq!(delivered.as_deref(), Some(payload.as_slice()));
    }

    /// Property: Truncated messages don't crash the op dispatcher
    #[test]
    fn truncated_serverdata_handled(truncate_at in 0usize..40) {
        let data = ServerData {
            protocol: 23,
            server_count: 1,
            snap_frame_time: 50,
            player_num: 0,
            message: "hi".into(),
            ..Default::default()
        };
        let mut w = MessageWriter::new();
        w.write_u8(ServerOp::ServerData as u8);
        data.write(&mut w);
        let mut bytes = w.into_bytes();
        if truncate_at < bytes.len() {
            bytes.truncate(truncate_at);
            let mut r = MessageReader::new(&bytes);
            if let Ok(op) = r.read_u8() {
                if ServerOp::try_from(op) == Ok(ServerOp::ServerData) {
                    let _result = ServerData::read(&mut r);
                    // May fail or succeed - just shouldn't panic
                }
            }
        }
    }
}
