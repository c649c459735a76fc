//! Host input crossing into the emulation thread.
//!
//! Front-ends push events from their own threads through an [`InputSender`]; the machine drains
//! the queue between slices and hands each event to the registered [`InputSink`] (normally the
//! keyboard controller model).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use pcx_cpu_core::InterruptController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// Set-1 scancode byte.
    Key { scancode: u8, pressed: bool },
    MouseMove { dx: i16, dy: i16 },
    /// Bit 0 left, bit 1 right, bit 2 middle.
    MouseButtons(u8),
}

/// Consumer of host input on the emulation thread.
pub trait InputSink {
    fn handle_input(&mut self, event: InputEvent, pic: &mut dyn InterruptController);
}

type Shared = Arc<Mutex<VecDeque<InputEvent>>>;

fn lock(queue: &Shared) -> MutexGuard<'_, VecDeque<InputEvent>> {
    // A producer that panicked mid-push cannot leave the deque itself inconsistent.
    queue.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Producer handle; cheap to clone and safe to move to another thread.
#[derive(Debug, Clone)]
pub struct InputSender {
    queue: Shared,
}

impl InputSender {
    pub fn send(&self, event: InputEvent) {
        lock(&self.queue).push_back(event);
    }
}

/// The consumer end, owned by the machine.
#[derive(Debug, Default)]
pub struct InputQueue {
    queue: Shared,
}

impl InputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(&self) -> InputSender {
        InputSender {
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every queued event, oldest first.
    pub fn take_all(&self) -> VecDeque<InputEvent> {
        std::mem::take(&mut *lock(&self.queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn senders_share_one_queue() {
        let queue = InputQueue::new();
        let a = queue.sender();
        let b = a.clone();
        a.send(InputEvent::MouseButtons(1));
        b.send(InputEvent::Key {
            scancode: 0x1e,
            pressed: true,
        });
        assert_eq!(queue.len(), 2);

        let events: Vec<_> = queue.take_all().into();
        assert_eq!(events[0], InputEvent::MouseButtons(1));
        assert!(queue.is_empty());
    }

    #[test]
    fn sender_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<InputSender>();
    }
}
