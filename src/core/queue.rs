use std::collections::{HashSet, VecDeque};
use super::types::UploadId;

/// FIFO of queued items plus the running-job counter that enforces the
/// concurrency limit. `None` means unbounded.
pub(crate) struct JobQueue {
    pending: VecDeque<UploadId>,
    /// 与 pending 内容一致，用于去重
    queued: HashSet<UploadId>,
    active: usize,
    limit: Option<usize>,
}

impl JobQueue {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            pending: VecDeque::new(),
            queued: HashSet::new(),
            active: 0,
            // 限制为 0 没有意义，按 1 处理
            limit: limit.map(|limit| limit.max(1)),
        }
    }

    pub(crate) fn push(&mut self, id: UploadId) {
        if self.queued.insert(id) {
            self.pending.push_back(id);
        }
    }

    pub(crate) fn remove(&mut self, id: &UploadId) -> bool {
        if !self.queued.remove(id) {
            return false;
        }

        self.pending.retain(|queued| queued != id);
        true
    }

    fn has_capacity(&self) -> bool {
        self.limit.is_none_or(|limit| self.active < limit)
    }

    /// Pops the next item if a slot is free and counts it as running.
    pub(crate) fn next_ready(&mut self) -> Option<UploadId> {
        if !self.has_capacity() {
            return None;
        }

        let id = self.pending.pop_front()?;
        self.queued.remove(&id);
        self.active += 1;
        Some(id)
    }

    /// Frees the slot of a job that has ended.
    pub(crate) fn finish(&mut self) {
        self.active = self.active.saturating_sub(1);
    }

    pub(crate) fn active(&self) -> usize {
        self.active
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
