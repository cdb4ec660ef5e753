use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

type Teardown = Box<dyn FnOnce() -> anyhow::Result<()>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisposeError {
    pub failures: Vec<String>,
}

impl fmt::Display for DisposeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.failures.join("\n"))
    }
}

impl std::error::Error for DisposeError {}

struct Node {
    name: String,
    parent: Weak<Node>,
    state: RefCell<NodeState>,
}

#[derive(Default)]
struct NodeState {
    disposed: bool,
    children: Vec<Rc<Node>>,
    teardown: Option<Teardown>,
}

/// A node in the host's disposal tree. Disposing a node disposes its
/// children, newest first, and then runs its own teardown. Lives on the UI
/// thread only.
#[derive(Clone)]
pub struct Disposable {
    node: Rc<Node>,
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Disposable")
            .field("name", &self.node.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Disposable {
    pub fn root(name: &str) -> Disposable {
        Disposable {
            node: Rc::new(Node {
                name: name.to_string(),
                parent: Weak::new(),
                state: RefCell::new(NodeState::default()),
            }),
        }
    }

    /// Registers a new child. The child of a disposed node starts out disposed.
    pub fn child(&self, name: &str) -> Disposable {
        let disposed = self.is_disposed();
        let node = Rc::new(Node {
            name: name.to_string(),
            parent: Rc::downgrade(&self.node),
            state: RefCell::new(NodeState {
                disposed,
                ..NodeState::default()
            }),
        });
        if !disposed {
            self.node.state.borrow_mut().children.push(node.clone());
        }
        Disposable { node }
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn is_disposed(&self) -> bool {
        self.node.state.borrow().disposed
    }

    pub fn child_count(&self) -> usize {
        self.node.state.borrow().children.len()
    }

    /// Sets the callback run when this node is disposed. On an already
    /// disposed node the callback runs immediately.
    pub fn set_teardown(&self, teardown: impl FnOnce() -> anyhow::Result<()> + 'static) -> Result<(), DisposeError> {
        let mut state = self.node.state.borrow_mut();
        if state.disposed {
            drop(state);
            return run_teardown(&self.node.name, Box::new(teardown))
                .map_err(|failure| DisposeError { failures: vec![failure] });
        }
        state.teardown = Some(Box::new(teardown));
        Ok(())
    }

    /// Idempotent. All failures below this node are collected, none stops
    /// the rest of the tree from being disposed.
    pub fn dispose(&self) -> Result<(), DisposeError> {
        let (children, teardown) = {
            let mut state = self.node.state.borrow_mut();
            if state.disposed {
                return Ok(());
            }
            state.disposed = true;
            (std::mem::take(&mut state.children), state.teardown.take())
        };

        let mut failures = vec![];
        for node in children.into_iter().rev() {
            if let Err(e) = (Disposable { node }).dispose() {
                failures.extend(e.failures);
            }
        }
        if let Some(teardown) = teardown
            && let Err(failure) = run_teardown(&self.node.name, teardown)
        {
            failures.push(failure);
        }
        self.detach();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DisposeError { failures })
        }
    }

    fn detach(&self) {
        if let Some(parent) = self.node.parent.upgrade() {
            parent
                .state
                .borrow_mut()
                .children
                .retain(|child| !Rc::ptr_eq(child, &self.node));
        }
    }
}

fn run_teardown(name: &str, teardown: Teardown) -> Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(teardown)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{name}: {e:#}")),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("{name}: panicked: {message}"))
        }
    }
}
