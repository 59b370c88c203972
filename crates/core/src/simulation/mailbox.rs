use std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

/// Single-threaded FIFO with one parked waker.
///
/// Producers push from event callbacks, a cooperative task awaits `recv`.
/// Only the most recent poller is remembered, so a mailbox is meant to be
/// consumed by one task at a time.
pub struct Mailbox<T> {
    state: Rc<RefCell<MailboxState<T>>>,
}

struct MailboxState<T> {
    items: VecDeque<T>,
    waker: Option<Waker>,
    closed: bool,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(MailboxState {
                items: VecDeque::new(),
                waker: None,
                closed: false,
            })),
        }
    }

    /// Enqueues an item and wakes the waiting task, if any.
    ///
    /// Items pushed after `close` are dropped.
    pub fn push(&self, item: T) {
        let waker = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return;
            }
            state.items.push_back(item);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.state.borrow_mut().items.pop_front()
    }

    /// Resolves to the next item, or `None` once the mailbox is closed and drained.
    pub fn recv(&self) -> Recv<T> {
        Recv {
            mailbox: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().items.is_empty()
    }

    /// Stops accepting items and wakes the waiter so it can observe the end.
    pub fn close(&self) {
        let waker = {
            let mut state = self.state.borrow_mut();
            state.closed = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}

/// Future returned by [`Mailbox::recv`].
pub struct Recv<T> {
    mailbox: Mailbox<T>,
}

impl<T> Future for Recv<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.mailbox.state.borrow_mut();
        if let Some(item) = state.items.pop_front() {
            return Poll::Ready(Some(item));
        }
        if state.closed {
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}
