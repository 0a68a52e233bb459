//! 投递计数（DeliveryTracker）
//!
//! 以消息标识为键记录失败的投递次数，状态机为：
//! `Unseen → Attempting(count) → {Resolved | DeadLettered}`。
//!
//! - 首次失败创建记录（`count = 1`），之后每次失败加一；
//! - `count` 达到最大投递次数时转入死信，记录随即删除；
//! - 任意一次成功处理即删除记录，不产生死信；
//! - 递增与阈值比较在同一个键锁内完成，并发上报同一消息的失败不会丢失计数，
//!   也只会有一个调用方得到 [`DeliveryOutcome::DeadLetter`]。
//!
//! 计数器只记录被告知的失败，重投由传输层负责。
//!
use crate::error::{BusError, BusResult};
use crate::message::MessageId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// 一次失败上报后的结论
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 尚未达到上限，等待传输层重投
    Retry { attempts: u32 },
    /// 达到上限，应转入死信
    DeadLetter { attempts: u32 },
}

#[derive(Debug)]
pub struct DeliveryTracker {
    max_delivery_attempts: u32,
    attempts: DashMap<MessageId, u32>,
}

impl DeliveryTracker {
    pub fn new(max_delivery_attempts: u32) -> BusResult<Self> {
        if max_delivery_attempts == 0 {
            return Err(BusError::InvalidConfig {
                reason: "max_delivery_attempts must be at least 1".into(),
            });
        }

        Ok(Self {
            max_delivery_attempts,
            attempts: DashMap::new(),
        })
    }

    pub fn max_delivery_attempts(&self) -> u32 {
        self.max_delivery_attempts
    }

    /// 记录一次失败的投递
    pub fn record_failure(&self, id: MessageId) -> DeliveryOutcome {
        let max = self.max_delivery_attempts;

        match self.attempts.entry(id) {
            Entry::Occupied(mut entry) => {
                let attempts = entry.get().saturating_add(1);
                if attempts >= max {
                    entry.remove();
                    DeliveryOutcome::DeadLetter { attempts }
                } else {
                    *entry.get_mut() = attempts;
                    DeliveryOutcome::Retry { attempts }
                }
            }
            Entry::Vacant(entry) => {
                if max <= 1 {
                    DeliveryOutcome::DeadLetter { attempts: 1 }
                } else {
                    entry.insert(1);
                    DeliveryOutcome::Retry { attempts: 1 }
                }
            }
        }
    }

    /// 记录一次成功处理，丢弃该消息的计数
    pub fn record_success(&self, id: MessageId) {
        self.attempts.remove(&id);
    }

    /// 消息未经计数判定而结案（例如无法重投而直接转入死信）时丢弃其计数
    pub fn discard(&self, id: MessageId) {
        self.attempts.remove(&id);
    }

    /// 当前失败次数，未失败或已结案的消息返回 `None`
    pub fn attempts(&self, id: MessageId) -> Option<u32> {
        self.attempts.get(&id).map(|a| *a)
    }

    /// 正在重试中的消息数
    pub fn in_flight(&self) -> usize {
        self.attempts.len()
    }
}
