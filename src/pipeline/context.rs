use crate::notification::Message;

/// Per-message state shared by the sink chain.
///
/// Created fresh for every dispatch attempt and never persisted.
#[derive(Debug)]
pub struct SinkContext {
    message: Message,
    stopped: bool,
}

impl SinkContext {
    pub(crate) fn new(message: Message) -> Self {
        Self {
            message,
            stopped: false,
        }
    }

    /// The message as returned by the previous sink
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Halt the chain after the current sink. Publishing still happens.
    pub fn stop_processing(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub(crate) fn set_message(&mut self, message: Message) {
        self.message = message;
    }

    pub(crate) fn into_message(self) -> Message {
        self.message
    }
}

/// Per-message state shared by the publisher fan-out.
#[derive(Debug)]
pub struct PublishContext {
    message: Message,
    complete: bool,
}

impl PublishContext {
    pub(crate) fn new(message: Message) -> Self {
        Self {
            message,
            complete: false,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Mark the message as handled; remaining publishers are skipped
    pub fn set_complete(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }
}
