//! # Quorum-Sampled Consensus
//!
//! Three consecutive TLC rounds decide one block per consensus instance.
//! Round `s` spreads the client's proposal; round `s+1` re-proposes the
//! highest-fitness confirmation of `s`; round `s+2` carries the
//! highest-fitness confirmation of `s+1` (carrier traffic — the decision
//! reads only the confirmations of `s` and `s+1`).
//!
//! The decision rule: let `best` be the highest-fitness confirmation of
//! round `s`. Consensus is reached iff no message observed in round `s`
//! has fitness ≥ `best` with a different block hash, and some
//! confirmation of round `s+1` carries `best`'s block. On success the
//! chain is extended; on failure only the proposal parent moves to the
//! best losing block so the next instance builds on it.

use std::collections::HashMap;
use tracing::warn;

use crate::consensus::tlc::ConsensusEngine;
use crate::events::FileEvent;
use crate::output;
use crate::packet::TlcMessage;

/// The confirmation with the highest fitness, if any.
pub fn highest_fitness(confirmations: &HashMap<String, TlcMessage>) -> Option<&TlcMessage> {
    confirmations
        .values()
        .max_by(|a, b| a.fitness.partial_cmp(&b.fitness).unwrap_or(std::cmp::Ordering::Equal))
}

impl ConsensusEngine {
    /// Runs one full QSC instance for a client proposal.
    pub async fn qsc_round(&self, proposal: TlcMessage) {
        let round_s = self.my_time();

        // Round s: spread the client's block.
        self.tlc_round(proposal).await;
        let Some(confirmations_s) = self.confirmations_for(round_s) else {
            warn!(round_s, "QSC round s yielded no confirmations");
            return;
        };
        let Some(m1) = highest_fitness(&confirmations_s).cloned() else {
            return;
        };

        // Round s+1: re-propose the best block of round s.
        let carrier1 = self.create_tlc_message(m1.tx_block.clone(), -1, m1.fitness);
        self.tlc_round(carrier1).await;
        let Some(confirmations_s1) = self.confirmations_for(round_s + 1) else {
            warn!(round = round_s + 1, "QSC round s+1 yielded no confirmations");
            return;
        };
        let Some(m2) = highest_fitness(&confirmations_s1).cloned() else {
            return;
        };

        // Round s+2: carrier traffic only.
        let carrier2 = self.create_tlc_message(m2.tx_block.clone(), -1, m2.fitness);
        self.tlc_round(carrier2).await;
        if self.confirmations_for(round_s + 2).is_none() {
            warn!(round = round_s + 2, "QSC round s+2 yielded no confirmations");
            return;
        }

        match self.decide(&confirmations_s, &confirmations_s1, round_s) {
            Some(chosen) => self.commit_block(round_s, &chosen),
            None => {
                // No consensus: chain untouched, but the next proposal
                // builds on the best block of round s+1.
                if let Some(best_s1) = highest_fitness(&confirmations_s1) {
                    *self.previous_hash.lock() = best_s1.tx_block.hash();
                    if best_s1.origin == self.config.name {
                        let tx = &best_s1.tx_block.transaction;
                        self.events.file_indexed(FileEvent {
                            name: tx.name.clone(),
                            meta_hash: hex::encode(&tx.metafile_hash),
                            size: tx.size,
                        });
                    }
                }
            }
        }
    }

    /// The QSC decision over the recorded evidence of rounds s and s+1.
    pub(crate) fn decide(
        &self,
        confirmations_s: &HashMap<String, TlcMessage>,
        confirmations_s1: &HashMap<String, TlcMessage>,
        round_s: u32,
    ) -> Option<TlcMessage> {
        let best = highest_fitness(confirmations_s)?.clone();
        let best_hash = best.tx_block.hash();

        // A competing observed message with fitness at least as high
        // vetoes the decision.
        let seen = self.messages_seen_for(round_s);
        for observed in seen.values() {
            if observed.fitness >= best.fitness && observed.tx_block.hash() != best_hash {
                return None;
            }
        }

        // The best block must have been re-confirmed in round s+1.
        confirmations_s1
            .values()
            .any(|message| message.tx_block.hash() == best_hash)
            .then_some(best)
    }

    /// Extends the committed chain with the decided block.
    pub(crate) fn commit_block(&self, round_s: u32, chosen: &TlcMessage) {
        let mut block = chosen.tx_block.clone();
        block.prev_hash = *self.top_hash.lock();
        let hash = block.hash();

        self.committed.insert(hash, block);
        *self.top_hash.lock() = hash;
        *self.previous_hash.lock() = hash;

        if chosen.origin == self.config.name {
            let tx = &chosen.tx_block.transaction;
            self.events.file_indexed(FileEvent {
                name: tx.name.clone(),
                meta_hash: hex::encode(&tx.metafile_hash),
                size: tx.size,
            });
        }

        let line = output::consensus_reached(round_s, chosen, &self.chain_file_names());
        self.events.chain_log(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::block::{BlockPublish, TxPublish, ZERO_HASH};
    use crate::consensus::tlc::test_support::make_engine;
    use crate::packet::StatusPacket;

    fn message(origin: &str, id: u32, name: &str, fitness: f32) -> TlcMessage {
        TlcMessage {
            origin: origin.to_string(),
            id,
            confirmed: id as i32,
            tx_block: BlockPublish {
                prev_hash: ZERO_HASH,
                transaction: TxPublish {
                    name: name.to_string(),
                    size: 100,
                    metafile_hash: vec![0xaa; 32],
                },
            },
            vector_clock: StatusPacket::default(),
            fitness,
        }
    }

    fn confirmations(messages: &[TlcMessage]) -> HashMap<String, TlcMessage> {
        messages
            .iter()
            .map(|m| (m.origin.clone(), m.clone()))
            .collect()
    }

    #[test]
    fn highest_fitness_picks_maximum() {
        let set = confirmations(&[
            message("A", 1, "a", 0.9),
            message("B", 2, "b", 0.5),
            message("C", 3, "c", 0.1),
        ]);
        assert_eq!(highest_fitness(&set).unwrap().origin, "A");
        assert!(highest_fitness(&HashMap::new()).is_none());
    }

    #[tokio::test]
    async fn decision_requires_reconfirmation_in_next_round() {
        let engine = make_engine(3, true, true, None).await;
        let best = message("A", 1, "winner", 0.9);
        let confirmations_s = confirmations(&[best.clone(), message("B", 2, "loser", 0.5)]);

        // Round s+1 re-confirmed a different block only: no decision.
        let other_s1 = confirmations(&[message("C", 3, "loser", 0.5)]);
        assert!(engine.decide(&confirmations_s, &other_s1, 0).is_none());

        // Round s+1 carries the winner's block: decided.
        let winner_s1 = confirmations(&[message("C", 3, "winner", 0.9)]);
        let chosen = engine.decide(&confirmations_s, &winner_s1, 0).unwrap();
        assert_eq!(chosen.origin, "A");
        assert_eq!(chosen.tx_block.transaction.name, "winner");
    }

    #[tokio::test]
    async fn higher_fitness_sighting_vetoes_decision() {
        let engine = make_engine(3, true, true, None).await;
        let best = message("A", 1, "winner", 0.5);
        let confirmations_s = confirmations(&[best.clone()]);
        let confirmations_s1 = confirmations(&[message("C", 3, "winner", 0.5)]);

        // Without contradicting evidence the decision stands.
        assert!(engine
            .decide(&confirmations_s, &confirmations_s1, 0)
            .is_some());

        // An observed competing block with fitness >= best kills it.
        engine_test_inject_seen(&engine, 0, message("D", 4, "rival", 0.9));
        assert!(engine
            .decide(&confirmations_s, &confirmations_s1, 0)
            .is_none());
    }

    #[tokio::test]
    async fn same_block_sighting_does_not_veto() {
        let engine = make_engine(3, true, true, None).await;
        let best = message("A", 1, "winner", 0.5);
        let confirmations_s = confirmations(&[best.clone()]);
        let confirmations_s1 = confirmations(&[message("C", 3, "winner", 0.5)]);

        // The same block observed with equal fitness is not a competitor.
        engine_test_inject_seen(&engine, 0, message("E", 9, "winner", 0.5));
        assert!(engine
            .decide(&confirmations_s, &confirmations_s1, 0)
            .is_some());
    }

    #[tokio::test]
    async fn commit_extends_chain_and_moves_both_hashes() {
        let engine = make_engine(3, true, true, None).await;
        let chosen = message("local", 1, "first.bin", 0.9);
        engine.commit_block(0, &chosen);

        let top = *engine.top_hash.lock();
        assert_ne!(top, ZERO_HASH);
        assert_eq!(*engine.previous_hash.lock(), top);
        assert_eq!(engine.chain_file_names(), vec!["first.bin"]);

        let second = message("local", 2, "second.bin", 0.8);
        engine.commit_block(1, &second);
        assert_eq!(engine.chain_file_names(), vec!["first.bin", "second.bin"]);

        // The committed chain terminates at the zero hash.
        let mut hash = *engine.top_hash.lock();
        let mut steps = 0;
        while hash != ZERO_HASH {
            hash = engine.committed.get(&hash).unwrap().prev_hash;
            steps += 1;
        }
        assert_eq!(steps, 2);
    }

    /// Records a round-s sighting the way the TLC intake does.
    fn engine_test_inject_seen(engine: &ConsensusEngine, round: u32, message: TlcMessage) {
        engine.save_message_seen_for_tests(round, message);
    }
}
