use std::thread;

use binocle::capture::{exchange, Eye, FrameFormat};
use proptest::prelude::*;

const FORMAT: FrameFormat = FrameFormat::rgb(8, 4);

#[derive(Debug, Clone)]
enum Op {
    Publish(u8),
    Read,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![any::<u8>().prop_map(Op::Publish), Just(Op::Read)]
}

proptest! {
    #[test]
    fn reader_sees_exactly_the_last_published_frame(ops in prop::collection::vec(op(), 1..64)) {
        let (mut publisher, reader) = exchange(Eye::Left, FORMAT);
        let mut published: Option<(u64, u8)> = None;
        let mut last_seen = 0;

        for op in ops {
            match op {
                Op::Publish(byte) => {
                    let id = publisher.publish(&vec![byte; FORMAT.frame_len()]).unwrap();
                    prop_assert!(id > published.map_or(0, |(id, _)| id));
                    published = Some((id, byte));
                }
                Op::Read => match (published, reader.read_latest()) {
                    (None, None) => {}
                    (Some((id, byte)), Some(view)) => {
                        prop_assert_eq!(view.id(), id);
                        prop_assert!(view.iter().all(|&b| b == byte));
                        prop_assert!(view.id() >= last_seen);
                        last_seen = view.id();

                        let again = reader.read_latest().unwrap();
                        prop_assert_eq!(again.id(), view.id());
                        prop_assert_eq!(again.pixels(), view.pixels());
                    }
                    (expected, got) => {
                        prop_assert!(false, "expected {:?}, read {:?}", expected, got.map(|v| v.id()));
                    }
                },
            }
        }
    }
}

#[test]
fn concurrent_reader_never_sees_a_torn_frame() {
    const FRAMES: u64 = 2000;
    let (mut publisher, reader) = exchange(Eye::Right, FrameFormat::rgb(64, 32));

    let writer = thread::spawn(move || {
        for id in 1..=FRAMES {
            // Every byte of frame N is N mod 256.
            publisher
                .publish_with(|slot| {
                    slot.fill(id as u8);
                    Ok::<(), ()>(())
                })
                .unwrap();
        }
    });

    let mut last_seen = 0;
    let mut reads = 0u64;
    while last_seen < FRAMES {
        if let Some(view) = reader.read_latest() {
            let id = view.id();
            assert!(id >= last_seen, "identifier went backwards: {id} < {last_seen}");
            assert!(
                view.iter().all(|&b| b == id as u8),
                "frame {id} was torn"
            );
            last_seen = id;
            reads += 1;
        }
    }

    writer.join().unwrap();
    assert!(reads > 0);
    assert_eq!(reader.latest_id(), FRAMES);
}
