//! 优先级队列（PriorityQueue）
//!
//! 有界的待处理事件缓冲：按优先级降序出队，同优先级按入队顺序（FIFO）。
//! 深度达到上限时拒绝入队并返回 `false`，这是准入控制而非错误。
//!
use crate::event::Event;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tracing::{debug, warn};

/// 队列条目：事件 + 优先级 + 入队时间
///
/// 出队后所有权转移给投递管理器；重试时携带递增后的 `attempt` 重新入队。
#[derive(Debug, Clone)]
pub struct QueueEntry {
    event: Event,
    priority: i32,
    enqueued_at: DateTime<Utc>,
    seq: u64,
    attempt: u32,
}

impl QueueEntry {
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// 已失败的投递次数（首次投递为 0）
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn into_event(self) -> Event {
        self.event
    }

    pub(crate) fn retry(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // 大顶堆：优先级高者在前；同优先级序号小者（先入队）在前
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
pub struct PriorityQueue {
    heap: BinaryHeap<QueueEntry>,
    max_depth: usize,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            max_depth,
            next_seq: 0,
        }
    }

    /// 入队；队列已满（含深度为 0）时返回 `false`
    pub fn enqueue(&mut self, event: Event, priority: i32) -> bool {
        let entry = QueueEntry {
            event,
            priority,
            enqueued_at: Utc::now(),
            seq: 0,
            attempt: 0,
        };
        self.push(entry)
    }

    /// 以原优先级重新入队（重试）；排在同优先级的已有条目之后
    pub(crate) fn requeue(&mut self, entry: QueueEntry) -> bool {
        self.push(entry)
    }

    fn push(&mut self, mut entry: QueueEntry) -> bool {
        if self.heap.len() >= self.max_depth {
            warn!(
                event_id = entry.event.id(),
                max_depth = self.max_depth,
                "priority queue full, rejecting event"
            );
            return false;
        }

        entry.seq = self.next_seq;
        self.next_seq += 1;
        debug!(
            event_id = entry.event.id(),
            priority = entry.priority,
            depth = self.heap.len() + 1,
            "event enqueued"
        );
        self.heap.push(entry);
        true
    }

    /// 取出至多 `max_count` 个最高优先级条目，按出队顺序返回
    pub fn dequeue_batch(&mut self, max_count: usize) -> Vec<QueueEntry> {
        let count = max_count.min(self.heap.len());
        let mut batch = Vec::with_capacity(count);
        while batch.len() < count {
            match self.heap.pop() {
                Some(entry) => batch.push(entry),
                None => break,
            }
        }
        batch
    }

    pub fn peek(&self) -> Option<&Event> {
        self.heap.peek().map(|entry| &entry.event)
    }

    pub fn size(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// 清空队列，返回丢弃的条目数
    pub fn clear(&mut self) -> usize {
        let dropped = self.heap.len();
        self.heap.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(id: &str) -> Event {
        Event::builder()
            .id(id)
            .event_type("test")
            .data(json!({ "id": id }))
            .build()
    }

    fn ids(batch: &[QueueEntry]) -> Vec<&str> {
        batch.iter().map(|e| e.event().id()).collect()
    }

    #[test]
    fn new_queue_is_empty() {
        let queue = PriorityQueue::new(10);
        assert!(queue.is_empty());
        assert_eq!(queue.size(), 0);
        assert!(queue.peek().is_none());
    }

    #[test]
    fn orders_by_priority_then_fifo() {
        let mut queue = PriorityQueue::new(100);
        assert!(queue.enqueue(ev("low-1"), 1));
        assert!(queue.enqueue(ev("high-1"), 10));
        assert!(queue.enqueue(ev("mid-1"), 5));
        assert!(queue.enqueue(ev("high-2"), 10));
        assert!(queue.enqueue(ev("low-2"), 1));
        assert!(queue.enqueue(ev("mid-2"), 5));

        assert_eq!(queue.peek().map(Event::id), Some("high-1"));
        let batch = queue.dequeue_batch(10);
        assert_eq!(
            ids(&batch),
            vec!["high-1", "high-2", "mid-1", "mid-2", "low-1", "low-2"]
        );
    }

    #[test]
    fn equal_priority_keeps_insertion_order() {
        let mut queue = PriorityQueue::new(1000);
        let expected: Vec<String> = (0..200).map(|i| format!("e-{i}")).collect();
        for id in &expected {
            queue.enqueue(ev(id), 7);
        }
        let drained: Vec<String> = queue
            .dequeue_batch(1000)
            .into_iter()
            .map(|e| e.event().id().to_string())
            .collect();
        assert_eq!(drained, expected);
    }

    #[test]
    fn zero_depth_rejects_everything() {
        let mut queue = PriorityQueue::new(0);
        for i in 0..5 {
            assert!(!queue.enqueue(ev(&format!("e-{i}")), i));
        }
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn full_queue_rejects_until_drained() {
        let mut queue = PriorityQueue::new(2);
        assert!(queue.enqueue(ev("a"), 0));
        assert!(queue.enqueue(ev("b"), 0));
        assert!(!queue.enqueue(ev("c"), 100));
        assert_eq!(queue.dequeue_batch(1).len(), 1);
        assert!(queue.enqueue(ev("c"), 100));
        assert_eq!(queue.peek().map(Event::id), Some("c"));
    }

    #[test]
    fn batches_drain_25_events_as_10_10_5() {
        let mut queue = PriorityQueue::new(100);
        for i in 0..25 {
            queue.enqueue(ev(&format!("e-{i}")), 0);
        }

        let mut sizes = Vec::new();
        let mut last_size = queue.size();
        while !queue.is_empty() {
            let batch = queue.dequeue_batch(10);
            sizes.push(batch.len());
            assert!(queue.size() < last_size);
            last_size = queue.size();
        }
        assert_eq!(sizes, vec![10, 10, 5]);
        assert!(queue.dequeue_batch(10).is_empty());
    }

    #[test]
    fn requeue_keeps_priority_and_goes_behind_peers() {
        let mut queue = PriorityQueue::new(10);
        queue.enqueue(ev("first"), 3);
        queue.enqueue(ev("second"), 3);
        let first = queue.dequeue_batch(1).remove(0);
        assert!(queue.requeue(first.retry(1)));

        let batch = queue.dequeue_batch(10);
        assert_eq!(ids(&batch), vec!["second", "first"]);
        assert_eq!(batch[1].attempt(), 1);
        assert_eq!(batch[1].priority(), 3);
    }

    #[test]
    fn clear_reports_dropped_entries() {
        let mut queue = PriorityQueue::new(10);
        queue.enqueue(ev("a"), 0);
        queue.enqueue(ev("b"), 0);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
