//! Scratch memory shared by every convolution call made through one [Context].

use std::cell::RefCell;
use std::collections::HashMap;

use crate::{init::alloc_storage, tensor::*};

pub const WORKSPACE_LIMIT_VAR: &str = "NNCONV3D_WORKSPACE_LIMIT";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextConfig {
    /// Largest workspace, in bytes, a single call may ask for.
    pub workspace_limit: Option<usize>,
}

impl ContextConfig {
    /// Reads the workspace limit from `NNCONV3D_WORKSPACE_LIMIT`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let workspace_limit = match std::env::var(WORKSPACE_LIMIT_VAR) {
            Ok(value) => match value.trim().parse::<usize>() {
                Ok(limit) => Some(limit),
                Err(err) => {
                    tracing::warn!(%value, %err, "ignoring {WORKSPACE_LIMIT_VAR}");
                    None
                }
            },
            Err(_) => None,
        };
        Self { workspace_limit }
    }

    pub fn with_workspace_limit(mut self, bytes: usize) -> Self {
        self.workspace_limit = Some(bytes);
        self
    }
}

/// Owns the unfolded-patch workspace and the broadcast ones vector, per device and dtype.
///
/// Buffers only grow; a call that needs less than what is held reuses the existing buffer.
#[derive(Debug, Default)]
pub struct Context {
    config: ContextConfig,
    workspaces: HashMap<(Device, Dtype), Storage>,
    ones: HashMap<(Device, Dtype), Storage>,
}

/// Scratch buffers borrowed from a [Context] for the duration of one call.
#[derive(Debug)]
pub struct Scratch<'a> {
    pub(crate) workspace: Option<&'a mut Storage>,
    pub(crate) ones: Option<&'a Storage>,
}

fn held(map: &HashMap<(Device, Dtype), Storage>, key: &(Device, Dtype)) -> usize {
    map.get(key).and_then(Storage::len).unwrap_or(0)
}

impl Context {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            workspaces: HashMap::new(),
            ones: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Borrows a workspace of at least `workspace_len` elements and a ones vector of at
    /// least `ones_len` elements. Zero lengths borrow nothing.
    pub fn acquire(
        &mut self,
        device: Device,
        dtype: Dtype,
        workspace_len: usize,
        ones_len: usize,
    ) -> Result<Scratch<'_>, Error> {
        if device == Device::Phantom {
            return Ok(Scratch {
                workspace: None,
                ones: None,
            });
        }

        let key = (device, dtype);
        let requested = workspace_len * dtype.num_bytes();
        if let Some(limit) = self.config.workspace_limit {
            if requested > limit {
                return Err(Error::OutOfMemory {
                    device,
                    requested,
                    what: "workspace",
                });
            }
        }

        if workspace_len > held(&self.workspaces, &key) {
            self.workspaces.remove(&key);
            tracing::debug!(?device, ?dtype, workspace_len, "growing workspace");
            let buf = alloc_storage(device, dtype, workspace_len, dtype.zero(), "workspace")?;
            self.workspaces.insert(key, buf);
        }
        if ones_len > held(&self.ones, &key) {
            self.ones.remove(&key);
            tracing::debug!(?device, ?dtype, ones_len, "growing ones vector");
            let buf = alloc_storage(device, dtype, ones_len, dtype.one(), "ones vector")?;
            self.ones.insert(key, buf);
        }

        Ok(Scratch {
            workspace: if workspace_len > 0 {
                self.workspaces.get_mut(&key)
            } else {
                None
            },
            ones: if ones_len > 0 {
                self.ones.get(&key)
            } else {
                None
            },
        })
    }

    /// Bytes held by workspaces across all devices.
    pub fn workspace_bytes(&self) -> usize {
        self.workspaces
            .iter()
            .map(|((_, dtype), buf)| buf.len().unwrap_or(0) * dtype.num_bytes())
            .sum()
    }

    /// Releases every held buffer.
    pub fn clear(&mut self) {
        self.workspaces.clear();
        self.ones.clear();
    }
}

thread_local! {
    static DEFAULT_CONTEXT: RefCell<Context> = RefCell::new(Context::new(ContextConfig::from_env()));
}

/// Runs `f` with this thread's default context, or with a fresh one when the default is
/// already in use further up the stack.
pub fn with_default_context<R, F: FnOnce(&mut Context) -> R>(f: F) -> R {
    DEFAULT_CONTEXT.with(|ctx| match ctx.try_borrow_mut() {
        Ok(mut ctx) => f(&mut ctx),
        Err(_) => f(&mut Context::new(ContextConfig::from_env())),
    })
}
