#[cfg(test)]
mod chain_tests {
    use chain_order::{ChainKey, ChainState, GapEvent, Message, MessageChain, MessagePosition};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn key() -> ChainKey {
        ChainKey::new("publisher-a", "chain-1")
    }

    fn m(ts: i64, prev: Option<i64>) -> Message {
        Message::new(
            key(),
            MessagePosition::new(ts, 0),
            prev.map(|p| MessagePosition::new(p, 0)),
            format!("payload-{}", ts).into_bytes(),
        )
    }

    /// ts = 100, 200, ... with each message pointing at the one before.
    fn linear_chain(n: usize) -> Vec<Message> {
        (0..n as i64)
            .map(|i| m((i + 1) * 100, if i == 0 { None } else { Some(i * 100) }))
            .collect()
    }

    fn timestamps(msgs: &[Message]) -> Vec<i64> {
        msgs.iter().map(|m| m.position.timestamp).collect()
    }

    #[test]
    fn test_in_order_delivery() {
        let mut chain = MessageChain::new(key());
        let mut delivered = Vec::new();
        for msg in linear_chain(5) {
            let out = chain.add_message(msg);
            assert!(out.events.is_empty());
            delivered.extend(out.delivered);
        }
        assert_eq!(timestamps(&delivered), vec![100, 200, 300, 400, 500]);
        assert_eq!(chain.last_delivered(), Some(MessagePosition::new(500, 0)));
        assert_eq!(chain.state(), ChainState::Idle);
    }

    #[test]
    fn test_predecessor_arriving_late_is_delivered_first() {
        let mut chain = MessageChain::new(key());

        let out = chain.add_message(m(200, Some(100)));
        assert!(out.delivered.is_empty());
        assert_eq!(chain.state(), ChainState::AwaitingRepair);
        match out.events.as_slice() {
            [GapEvent::Opened(gap)] => {
                assert!(gap.is_bootstrap());
                assert_eq!(gap.to.position, MessagePosition::new(200, 0));
                assert_eq!(gap.missing_range(), None);
            }
            other => panic!("unexpected events {:?}", other),
        }

        let out = chain.add_message(m(100, None));
        assert_eq!(timestamps(&out.delivered), vec![100, 200]);
        assert_eq!(out.events, vec![GapEvent::Resolved(0)]);
        assert_eq!(chain.state(), ChainState::Idle);
    }

    #[test]
    fn test_order_invariant_over_permutations() {
        let mut rng = StdRng::seed_from_u64(7);
        let original = linear_chain(12);
        for _ in 0..300 {
            let mut shuffled = original.clone();
            shuffled.shuffle(&mut rng);

            let mut chain = MessageChain::new(key());
            let mut delivered = Vec::new();
            for msg in shuffled {
                delivered.extend(chain.add_message(msg).delivered);
            }
            assert_eq!(delivered, original);
            assert_eq!(chain.buffered_len(), 0);
            assert_eq!(chain.state(), ChainState::Idle);
        }
    }

    #[test]
    fn test_duplicates_are_emitted_once() {
        let mut chain = MessageChain::new(key());
        let msgs = linear_chain(2);
        let mut delivered = Vec::new();
        for _ in 0..5 {
            delivered.extend(chain.add_message(msgs[0].clone()).delivered);
        }
        for _ in 0..3 {
            delivered.extend(chain.add_message(msgs[1].clone()).delivered);
        }
        assert_eq!(timestamps(&delivered), vec![100, 200]);

        let out = chain.add_message(msgs[0].clone());
        assert!(out.duplicate);
        assert!(out.delivered.is_empty());
    }

    #[test]
    fn test_duplicate_of_buffered_message() {
        let mut chain = MessageChain::new(key());
        chain.add_message(m(100, None));
        let first = chain.add_message(m(300, Some(200)));
        assert!(!first.duplicate);
        let second = chain.add_message(m(300, Some(200)));
        assert!(second.duplicate);
        assert!(second.events.is_empty());
        assert_eq!(chain.buffered_len(), 1);
    }

    #[test]
    fn test_replay_after_fill_changes_nothing() {
        let mut chain = MessageChain::new(key());
        let msgs = linear_chain(4);
        chain.add_message(msgs[0].clone());
        chain.add_message(msgs[3].clone());
        let out = chain.reinject_repaired(vec![msgs[1].clone(), msgs[2].clone()]);
        assert_eq!(timestamps(&out.delivered), vec![200, 300, 400]);

        let replay = chain.reinject_repaired(msgs.clone());
        assert!(replay.delivered.is_empty());
        assert!(replay.events.is_empty());
        assert!(replay.duplicate);
        assert_eq!(chain.last_delivered(), Some(MessagePosition::new(400, 0)));
    }

    #[test]
    fn test_earlier_message_extends_open_gap() {
        let mut chain = MessageChain::new(key());
        chain.add_message(m(100, None));
        let out = chain.add_message(m(500, Some(400)));
        assert!(matches!(out.events.as_slice(), [GapEvent::Opened(g)] if g.id == 0));

        let out = chain.add_message(m(300, Some(200)));
        assert!(out.events.is_empty());
        let gap = chain.open_gap().unwrap();
        assert_eq!(gap.id, 0);
        assert_eq!(gap.from, Some(MessagePosition::new(100, 0)));
        assert_eq!(gap.to.position, MessagePosition::new(300, 0));
        assert_eq!(
            gap.missing_range(),
            Some((MessagePosition::new(100, 1), MessagePosition::new(200, 0)))
        );
    }

    #[test]
    fn test_partial_fill_moves_gap_forward() {
        let mut chain = MessageChain::new(key());
        chain.add_message(m(100, None));
        chain.add_message(m(300, Some(200)));
        chain.add_message(m(500, Some(400)));

        let out = chain.add_message(m(200, Some(100)));
        assert_eq!(timestamps(&out.delivered), vec![200, 300]);
        match out.events.as_slice() {
            [GapEvent::Resolved(0), GapEvent::Opened(gap)] => {
                assert_eq!(gap.id, 1);
                assert_eq!(gap.from, Some(MessagePosition::new(300, 0)));
                assert_eq!(gap.to.position, MessagePosition::new(500, 0));
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_abandon_skips_missing_range() {
        let mut chain = MessageChain::new(key());
        chain.add_message(m(100, None));
        chain.add_message(m(300, Some(200)));

        let (gap, out) = chain.abandon_gap(0).unwrap();
        assert_eq!(gap.from, Some(MessagePosition::new(100, 0)));
        assert_eq!(gap.to.position, MessagePosition::new(300, 0));
        assert_eq!(timestamps(&out.delivered), vec![300]);
        assert_eq!(out.events, vec![GapEvent::Abandoned(gap)]);
        assert_eq!(chain.state(), ChainState::Idle);

        // the skipped message is stale once it finally shows up
        let late = chain.add_message(m(200, Some(100)));
        assert!(late.duplicate);
        assert!(late.delivered.is_empty());

        let next = chain.add_message(m(400, Some(300)));
        assert_eq!(timestamps(&next.delivered), vec![400]);
    }

    #[test]
    fn test_abandon_delivers_contiguous_run_and_reopens() {
        let mut chain = MessageChain::new(key());
        chain.add_message(m(100, None));
        chain.add_message(m(300, Some(200)));
        chain.add_message(m(400, Some(300)));
        chain.add_message(m(600, Some(500)));

        let (_, out) = chain.abandon_gap(0).unwrap();
        assert_eq!(timestamps(&out.delivered), vec![300, 400]);
        match out.events.as_slice() {
            [GapEvent::Abandoned(old), GapEvent::Opened(new)] => {
                assert_eq!(old.id, 0);
                assert_eq!(new.id, 1);
                assert_eq!(new.from, Some(MessagePosition::new(400, 0)));
                assert_eq!(new.to.position, MessagePosition::new(600, 0));
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_abandon_of_closed_gap_is_noop() {
        let mut chain = MessageChain::new(key());
        chain.add_message(m(100, None));
        chain.add_message(m(300, Some(200)));
        chain.add_message(m(200, Some(100)));
        assert!(chain.abandon_gap(0).is_none());
        assert_eq!(chain.last_delivered(), Some(MessagePosition::new(300, 0)));
    }

    #[test]
    fn test_reinject_sorts_batch() {
        let mut chain = MessageChain::new(key());
        chain.add_message(m(100, None));
        chain.add_message(m(400, Some(300)));
        let out = chain.reinject_repaired(vec![m(300, Some(200)), m(200, Some(100))]);
        assert_eq!(timestamps(&out.delivered), vec![200, 300, 400]);
        assert_eq!(out.events, vec![GapEvent::Resolved(0)]);
    }

    #[test]
    fn test_sequence_number_orders_same_timestamp() {
        let mut chain = MessageChain::new(key());
        let a = Message::new(key(), MessagePosition::new(100, 0), None, "a");
        let b = Message::new(key(), MessagePosition::new(100, 1), Some(MessagePosition::new(100, 0)), "b");
        let c = Message::new(key(), MessagePosition::new(100, 2), Some(MessagePosition::new(100, 1)), "c");
        let mut delivered = Vec::new();
        for msg in [c, a, b] {
            delivered.extend(chain.add_message(msg).delivered);
        }
        let seqs: Vec<u32> = delivered.iter().map(|m| m.position.sequence_number).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_restarted_chain_without_predecessor() {
        let mut chain = MessageChain::new(key());
        chain.add_message(m(100, None));
        let out = chain.add_message(m(500, None));
        assert_eq!(timestamps(&out.delivered), vec![500]);
        // an older restart point is stale
        assert!(chain.add_message(m(50, None)).duplicate);
    }
}
