/// Request scheduler: admits waiting sequences, batches prefill vs decode
/// steps, and preempts running sequences when the block pool is exhausted.
///
/// Runs single-threaded and cooperative: the engine driver calls
/// `schedule()`, runs the model forward pass over the returned batch, then
/// calls `postprocess()` with the sampled tokens before calling `schedule()`
/// again. Every method here completes synchronously; there is no
/// suspension or interleaving within a single call.
use std::collections::VecDeque;

use cache::BlockManager;
use common::{Config, Sequence, SequenceStatus};

use crate::error::{Result, SchedulerError};

pub struct Scheduler {
    max_num_seqs: usize,
    max_num_batched_tokens: usize,
    eos: u32,
    block_manager: BlockManager,
    waiting: VecDeque<Sequence>,
    running: VecDeque<Sequence>,
}

impl Scheduler {
    pub fn new(config: &Config) -> Result<Self> {
        let num_kvcache_blocks =
            config.num_kvcache_blocks.ok_or(SchedulerError::MissingBlockPoolSize)?;

        Ok(Self {
            max_num_seqs: config.max_num_seqs,
            max_num_batched_tokens: config.max_num_batched_tokens,
            eos: config.eos,
            block_manager: BlockManager::new(num_kvcache_blocks, config.kvcache_block_size)?,
            waiting: VecDeque::new(),
            running: VecDeque::new(),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.waiting.is_empty() && self.running.is_empty()
    }

    pub fn add(&mut self, seq: Sequence) {
        self.waiting.push_back(seq);
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Produces the next batch. Prefill is always tried first and, if it
    /// admits anything, decode is skipped for this step entirely — a
    /// sequence that was just admitted doesn't also get a decode step in
    /// the same call.
    pub fn schedule(&mut self) -> (Vec<Sequence>, bool) {
        let prefill_batch = self.schedule_prefill();
        if !prefill_batch.is_empty() {
            return (prefill_batch, true);
        }
        (self.schedule_decode(), false)
    }

    fn schedule_prefill(&mut self) -> Vec<Sequence> {
        let mut scheduled = Vec::new();
        let mut num_batched_tokens = 0usize;

        while !self.waiting.is_empty() && scheduled.len() < self.max_num_seqs {
            let seq = self.waiting.front().expect("checked non-empty above");
            if num_batched_tokens + seq.len() > self.max_num_batched_tokens
                || !self.block_manager.can_allocate(seq)
            {
                break;
            }

            let mut seq = self.waiting.pop_front().expect("checked non-empty above");
            self.block_manager.allocate(&mut seq);
            num_batched_tokens += seq.len() - seq.num_cached_tokens;
            seq.status = SequenceStatus::Running;
            log::debug!("prefill admitted seq {} ({} tokens)", seq.seq_id, seq.len());
            self.running.push_back(seq.clone());
            scheduled.push(seq);
        }

        scheduled
    }

    fn schedule_decode(&mut self) -> Vec<Sequence> {
        let mut scheduled = Vec::new();

        while !self.running.is_empty() && scheduled.len() < self.max_num_seqs {
            let mut seq = self.running.pop_front().expect("checked non-empty above");
            let mut preempted_self = false;

            while !self.block_manager.can_append(&seq) {
                if let Some(victim) = self.running.pop_back() {
                    self.preempt(victim);
                } else {
                    self.preempt(seq);
                    preempted_self = true;
                    break;
                }
            }

            if !preempted_self {
                self.block_manager.may_append(&mut seq);
                scheduled.push(seq);
            }
        }

        assert!(!scheduled.is_empty(), "decode phase produced an empty batch");

        for seq in scheduled.iter().rev() {
            self.running.push_front(seq.clone());
        }

        scheduled
    }

    /// Evicts `seq` back to waiting, freeing every block it holds. Pushed
    /// to the *front* of waiting (not the back) so it is re-admitted on the
    /// very next prefill instead of queueing behind every other waiter,
    /// minimizing the rework a preempted sequence has to redo.
    fn preempt(&mut self, mut seq: Sequence) {
        log::debug!("preempting seq {}", seq.seq_id);
        seq.status = SequenceStatus::Waiting;
        self.block_manager.deallocate(&mut seq);
        self.waiting.push_front(seq);
    }

    /// Applies one sampled token to each sequence in `seqs` (the batch
    /// `schedule()` just returned), retiring any that hit EOS or
    /// `max_tokens`. Returns the same sequences, mutated, in the same
    /// order, so the driver can emit completions for the finished ones.
    ///
    /// `schedule()` hands the caller a snapshot of each running sequence
    /// rather than a live borrow (Rust has no equivalent to the reference
    /// implementation's shared mutable references into its running
    /// queue), so this is also where that snapshot is reconciled back into
    /// the scheduler's own `running` queue: non-finished sequences have
    /// their canonical entry overwritten with the post-token state;
    /// finished ones are removed from `running` entirely.
    pub fn postprocess(&mut self, seqs: Vec<Sequence>, sampled_token_ids: &[u32]) -> Vec<Sequence> {
        assert_eq!(seqs.len(), sampled_token_ids.len(), "one sampled token per sequence");

        let mut out = Vec::with_capacity(seqs.len());
        for (mut seq, &token_id) in seqs.into_iter().zip(sampled_token_ids) {
            seq.append_token(token_id);

            let hit_eos = !seq.ignore_eos && token_id == self.eos;
            let hit_max_tokens = seq.num_completion_tokens() == seq.max_tokens;

            if hit_eos || hit_max_tokens {
                seq.status = SequenceStatus::Finished;
                self.block_manager.deallocate(&mut seq);
                self.running.retain(|running| running.seq_id != seq.seq_id);
                log::debug!("seq {} finished ({} tokens generated)", seq.seq_id, seq.num_completion_tokens());
            } else if let Some(slot) = self.running.iter_mut().find(|r| r.seq_id == seq.seq_id) {
                *slot = seq.clone();
            }

            out.push(seq);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SamplingParams;

    fn config(num_blocks: usize, block_size: usize, max_num_seqs: usize) -> Config {
        Config {
            max_num_batched_tokens: 1_000_000,
            max_num_seqs,
            kvcache_block_size: block_size,
            num_kvcache_blocks: Some(num_blocks),
            eos: 9_999,
            ..Default::default()
        }
    }

    fn seq(tokens: Vec<u32>, block_size: usize, max_tokens: usize, ignore_eos: bool) -> Sequence {
        let params = SamplingParams { temperature: 1.0, max_tokens, ignore_eos };
        Sequence::with_block_size(tokens, params, block_size)
    }

    #[test]
    fn new_requires_block_pool_size() {
        let cfg = Config { num_kvcache_blocks: None, ..Default::default() };
        assert!(Scheduler::new(&cfg).is_err());
    }

    #[test]
    fn prefill_then_decode_one_step() {
        let cfg = config(8, 4, 4);
        let mut sched = Scheduler::new(&cfg).unwrap();
        sched.add(seq(vec![1, 2, 3], 4, 16, true));

        let (batch, is_prefill) = sched.schedule();
        assert!(is_prefill);
        assert_eq!(batch.len(), 1);
        assert_eq!(sched.num_running(), 1);

        let seqs = sched.postprocess(batch, &[4]);
        assert_eq!(seqs[0].len(), 4);
        assert_eq!(seqs[0].status, SequenceStatus::Running);

        let (batch, is_prefill) = sched.schedule();
        assert!(!is_prefill);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].len(), 4);
    }

    // S5 — preemption under memory pressure, literal spec parameters
    // (pool size 3, block_size 4, three 1-block prompts, max_num_seqs 3).
    //
    // Traced by hand: prefill consumes all 3 blocks (free=0), so the decode
    // step where every sequence opens its second block pops A first. A
    // can't append (free=0), so the tail of running (C) is evicted, freeing
    // one block — enough for A to append. B is popped next; by then that
    // freed block is already spent on A, so B can't append either, running
    // is now empty (nothing left to evict as a tail victim), and B
    // preempts itself. Only A ends up in the batch; B and C are both
    // preempted, with B queued ahead of C (most recently preempted goes to
    // the front of waiting).
    #[test]
    fn s5_preemption_evicts_tail_and_frees_its_blocks() {
        let cfg = config(3, 4, 3);
        let mut sched = Scheduler::new(&cfg).unwrap();
        for tokens in [vec![1, 2, 3, 4], vec![5, 6, 7, 8], vec![9, 10, 11, 12]] {
            sched.add(seq(tokens, 4, 64, true));
        }

        let (batch, is_prefill) = sched.schedule();
        assert!(is_prefill);
        assert_eq!(batch.len(), 3);
        assert_eq!(sched.num_running(), 3);

        // Every sequence's one block was already full at admission, so this
        // token just opens a fresh partial block for all three (len%4==1).
        let batch = sched.postprocess(batch, &[100, 101, 102]);
        assert_eq!(sched.num_running(), 3);

        let (batch, is_prefill) = sched.schedule();
        assert!(!is_prefill);
        assert_eq!(batch.len(), 1, "only the first popped sequence survives; both others are preempted");
        assert_eq!(sched.num_running(), 1);
        assert_eq!(sched.num_waiting(), 2);

        let survivor = &batch[0];
        assert_eq!(survivor.block_table.len(), 2);
        assert_eq!(survivor.status, SequenceStatus::Running);

        for victim in &sched.waiting {
            assert_eq!(victim.status, SequenceStatus::Waiting);
            assert!(victim.block_table.is_empty(), "preemption must free every block the victim held");
        }
    }

    // S6 — termination via max_tokens.
    #[test]
    fn s6_termination_on_max_tokens() {
        let cfg = config(8, 4, 4);
        let mut sched = Scheduler::new(&cfg).unwrap();
        sched.add(seq(vec![1, 2, 3], 4, 2, true));

        let (batch, _) = sched.schedule();
        let seqs = sched.postprocess(batch, &[4]);
        assert_eq!(seqs[0].status, SequenceStatus::Running);
        assert_eq!(sched.num_running(), 1);

        let (batch, _) = sched.schedule();
        let seqs = sched.postprocess(batch, &[5]);
        assert_eq!(seqs[0].status, SequenceStatus::Finished);
        assert_eq!(sched.num_running(), 0);
        assert!(sched.is_finished());
    }

    #[test]
    fn termination_on_eos() {
        let cfg = config(8, 4, 4);
        let mut sched = Scheduler::new(&cfg).unwrap();
        sched.add(seq(vec![1, 2, 3], 4, 64, false));

        let (batch, _) = sched.schedule();
        let seqs = sched.postprocess(batch, &[cfg.eos]);
        assert_eq!(seqs[0].status, SequenceStatus::Finished);
        assert!(sched.is_finished());
    }
}
