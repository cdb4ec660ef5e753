use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle, ThreadId};

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Message<S> {
    Task(Task<S>),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiError {
    /// The UI thread has shut down.
    Closed,
    /// The task panicked before producing a result.
    TaskPanicked,
    /// `invoke_and_wait` was called from the UI thread itself.
    Reentrant,
}

impl fmt::Display for UiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UiError::Closed => write!(f, "UI thread is not running"),
            UiError::TaskPanicked => write!(f, "UI task panicked"),
            UiError::Reentrant => write!(f, "Cannot wait for the UI thread from the UI thread"),
        }
    }
}

impl std::error::Error for UiError {}

/// Sends work to the thread that owns state `S`. All mutation of `S`
/// happens there, one task at a time.
pub struct UiHandle<S> {
    sender: Sender<Message<S>>,
    thread_id: ThreadId,
}

impl<S> Clone for UiHandle<S> {
    fn clone(&self) -> Self {
        UiHandle {
            sender: self.sender.clone(),
            thread_id: self.thread_id,
        }
    }
}

impl<S> UiHandle<S> {
    pub fn is_ui_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn invoke_later(&self, task: impl FnOnce(&mut S) + Send + 'static) -> Result<(), UiError> {
        self.sender
            .send(Message::Task(Box::new(task)))
            .map_err(|_| UiError::Closed)
    }

    /// Runs `task` on the UI thread and blocks until it has finished.
    pub fn invoke_and_wait<T: Send + 'static>(
        &self,
        task: impl FnOnce(&mut S) -> T + Send + 'static,
    ) -> Result<T, UiError> {
        if self.is_ui_thread() {
            return Err(UiError::Reentrant);
        }
        let (result_tx, result_rx) = mpsc::sync_channel(1);
        self.invoke_later(move |state| {
            let _ = result_tx.send(task(state));
        })?;
        result_rx.recv().map_err(|_| UiError::TaskPanicked)
    }

    /// Asks the UI thread to stop after the tasks already queued.
    pub fn shutdown(&self) {
        let _ = self.sender.send(Message::Shutdown);
    }
}

pub struct UiThread {
    handle: JoinHandle<()>,
}

impl UiThread {
    pub fn join(self) {
        if self.handle.join().is_err() {
            log::error!("UI thread terminated abnormally");
        }
    }
}

/// Starts a UI thread owning the state produced by `init`.
pub fn spawn<S: 'static>(
    name: &str,
    init: impl FnOnce() -> S + Send + 'static,
) -> io::Result<(UiHandle<S>, UiThread)> {
    let (sender, receiver) = mpsc::channel::<Message<S>>();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || event_loop(init(), receiver))?;
    let ui = UiHandle {
        sender,
        thread_id: handle.thread().id(),
    };
    Ok((ui, UiThread { handle }))
}

fn event_loop<S>(mut state: S, receiver: Receiver<Message<S>>) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Task(task) => {
                if panic::catch_unwind(AssertUnwindSafe(|| task(&mut state))).is_err() {
                    log::error!("A task on the UI thread panicked");
                }
            }
            Message::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_run_in_order_on_one_thread() {
        let (ui, thread) = spawn("test-ui", Vec::<u32>::new).unwrap();
        for i in 0..5 {
            ui.invoke_later(move |state| state.push(i)).unwrap();
        }
        let seen = ui.invoke_and_wait(|state| state.clone()).unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(!ui.is_ui_thread());

        ui.shutdown();
        thread.join();
        assert_eq!(ui.invoke_and_wait(|state| state.len()), Err(UiError::Closed));
    }

    #[test]
    fn panicking_task_does_not_stop_the_thread() {
        let (ui, thread) = spawn("test-ui", || 0u32).unwrap();
        let result = ui.invoke_and_wait(|_| -> u32 { panic!("task failure") });
        assert_eq!(result, Err(UiError::TaskPanicked));
        assert_eq!(ui.invoke_and_wait(|n| { *n += 1; *n }), Ok(1));
        ui.shutdown();
        thread.join();
    }

    #[test]
    fn waiting_from_the_ui_thread_is_rejected() {
        let (ui, thread) = spawn("test-ui", || ()).unwrap();
        let inner = ui.clone();
        let nested = ui.invoke_and_wait(move |_| inner.invoke_and_wait(|_| 1)).unwrap();
        assert_eq!(nested, Err(UiError::Reentrant));
        ui.shutdown();
        thread.join();
    }
}
