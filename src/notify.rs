use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoticeLevel {
    Success,
    Info,
    Warning,
    Error,
}

/// One user-facing outcome. The orchestrator is the only producer on the
/// happy path; surfaces render these however they like.
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
        }
    }
}

type Subscriber = Arc<dyn Fn(&Notice) + Send + Sync>;

/// Queue plus fan-out for notices. Subscribers see every notice as it is
/// pushed; `drain` hands the backlog to surfaces that poll instead.
#[derive(Clone, Default)]
pub struct NoticeCenter {
    queue: Arc<Mutex<Vec<Notice>>>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl NoticeCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, notice: Notice) {
        for subscriber in self.subscribers.lock().iter() {
            subscriber(&notice);
        }
        self.queue.lock().push(notice);
    }

    pub fn subscribe(&self, subscriber: impl Fn(&Notice) + Send + Sync + 'static) {
        self.subscribers.lock().push(Arc::new(subscriber));
    }

    pub fn drain(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}
