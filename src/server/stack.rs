use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};

/// The stack was closed; no more tunnels will be offered.
#[derive(Debug, PartialEq, Eq)]
pub struct Closed;

/// LIFO rendezvous handing out the most recently idle tunnel.
///
/// A single coordinator task owns the storage and arbitrates between
/// incoming offers and parked acquirers. An offer arriving while an
/// acquirer is parked is handed over directly, bypassing the stack. After
/// a burst, surplus tunnels sink to the bottom and are the ones the idle
/// timeout eventually reaps; hot tunnels stay on top.
#[derive(Debug)]
pub struct IdleStack<T> {
    cmd: mpsc::UnboundedSender<Cmd<T>>,
}

impl<T> Clone for IdleStack<T> {
    fn clone(&self) -> Self {
        Self {
            cmd: self.cmd.clone(),
        }
    }
}

enum Cmd<T> {
    Offer(T),
    Acquire(oneshot::Sender<T>),
    TryAcquire(oneshot::Sender<Option<T>>),
    Close,
}

impl<T: Send + 'static> IdleStack<T> {
    pub fn new() -> Self {
        let (cmd, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self { cmd }
    }

    /// Push an item on top of the stack, or hand it straight to a parked
    /// acquirer. Never blocks. A no-op once the stack is closed.
    pub fn offer(&self, item: T) {
        let _ = self.cmd.send(Cmd::Offer(item));
    }

    /// Wait for the next available item. The caller holds it exclusively.
    ///
    /// Dropping the returned future mid-wait is safe: an item that was
    /// already handed to it bounces back onto the top of the stack.
    pub async fn acquire(&self) -> Result<T, Closed> {
        let (reply, rx) = oneshot::channel();
        self.cmd.send(Cmd::Acquire(reply)).map_err(|_| Closed)?;

        let mut bounce = Bounce {
            rx: Some(rx),
            stack: self.clone(),
        };
        let result = match bounce.rx.as_mut() {
            Some(rx) => rx.await.map_err(|_| Closed),
            None => Err(Closed),
        };
        if result.is_ok() {
            // Consumed; nothing left to bounce.
            bounce.rx = None;
        }
        result
    }

    /// Pop the top of the stack if one is immediately available.
    pub async fn try_acquire(&self) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd.send(Cmd::TryAcquire(reply)).ok()?;
        rx.await.ok().flatten()
    }

    /// Close the stack, releasing every parked acquirer with [`Closed`].
    pub fn close(&self) {
        let _ = self.cmd.send(Cmd::Close);
    }
}

impl<T: Send + 'static> Default for IdleStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns an item that was delivered to an abandoned acquire future.
struct Bounce<T: Send + 'static> {
    rx: Option<oneshot::Receiver<T>>,
    stack: IdleStack<T>,
}

impl<T: Send + 'static> Drop for Bounce<T> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if let Ok(item) = rx.try_recv() {
                self.stack.offer(item);
            }
        }
    }
}

async fn run<T>(mut rx: mpsc::UnboundedReceiver<Cmd<T>>) {
    let mut stack: Vec<T> = Vec::new();
    let mut waiters: VecDeque<oneshot::Sender<T>> = VecDeque::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Cmd::Offer(mut item) => loop {
                match waiters.pop_front() {
                    Some(waiter) => match waiter.send(item) {
                        Ok(()) => break,
                        // The acquirer went away; try the next one.
                        Err(back) => item = back,
                    },
                    None => {
                        stack.push(item);
                        break;
                    }
                }
            },
            Cmd::Acquire(waiter) => match stack.pop() {
                Some(item) => {
                    if let Err(back) = waiter.send(item) {
                        stack.push(back);
                    }
                }
                None => waiters.push_back(waiter),
            },
            Cmd::TryAcquire(reply) => {
                let item = stack.pop();
                if let Err(Some(back)) = reply.send(item) {
                    stack.push(back);
                }
            }
            Cmd::Close => break,
        }
    }
    // Dropping the waiters signals Closed to every parked acquirer.
}
