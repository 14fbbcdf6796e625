//! Remote-procedure dispatch.
//!
//! Handlers are registered into explicit tables keyed by numeric ids: a
//! global table for session-scoped procedures and a view table for
//! procedures bound to replicated object instances. Dispatch is a table
//! lookup; there is no reflection and no global mutable state.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, RwLock};

use pulsar_proto::PeerId;

/// Errors raised by registration and dispatch.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// A handler is already registered under this id.
    #[error("rpc {rpc_id} already registered")]
    DuplicateRegistration { rpc_id: u8 },

    /// No handler is registered under this id.
    #[error("no handler for rpc {rpc_id}")]
    UnknownRpc { rpc_id: u8 },

    /// The addressed view does not exist.
    #[error("no view with id {view_id}")]
    TargetNotFound { view_id: u16 },

    /// The argument buffer ended before the handler finished reading.
    #[error("argument read failed: {0}")]
    Args(#[from] std::io::Error),

    /// The handler itself reported a failure.
    #[error("handler failed: {0}")]
    Handler(String),
}

/// The calling context handed to a procedure handler: who sent the call and
/// a reader over the raw argument bytes.
pub struct RpcArgs<'a> {
    /// The peer that issued the call, as recorded by the server. Never
    /// taken from the packet body, so it cannot be spoofed.
    pub sender: PeerId,
    cursor: std::io::Cursor<&'a [u8]>,
}

impl<'a> RpcArgs<'a> {
    pub fn new(sender: PeerId, args: &'a [u8]) -> Self {
        Self {
            sender,
            cursor: std::io::Cursor::new(args),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, RpcError> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, RpcError> {
        let mut buf = [0u8; 2];
        self.cursor.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self) -> Result<u32, RpcError> {
        let mut buf = [0u8; 4];
        self.cursor.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_f32(&mut self) -> Result<f32, RpcError> {
        let mut buf = [0u8; 4];
        self.cursor.read_exact(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    /// Read a length-prefixed UTF-8 string (u16 length).
    pub fn read_string(&mut self) -> Result<String, RpcError> {
        let len = self.read_u16()? as usize;
        let mut buf = vec![0u8; len];
        self.cursor.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|e| RpcError::Handler(e.to_string()))
    }

    /// Everything not yet consumed.
    pub fn remaining(&self) -> &[u8] {
        let pos = self.cursor.position() as usize;
        &self.cursor.get_ref()[pos.min(self.cursor.get_ref().len())..]
    }
}

impl Read for RpcArgs<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

/// A registered procedure handler.
///
/// Implemented for any `Fn(&mut RpcArgs) -> Result<(), RpcError>` closure,
/// so call sites register plain closures.
pub trait RpcHandler: Send + Sync {
    fn invoke(&self, args: &mut RpcArgs<'_>) -> Result<(), RpcError>;
}

impl<F> RpcHandler for F
where
    F: Fn(&mut RpcArgs<'_>) -> Result<(), RpcError> + Send + Sync,
{
    fn invoke(&self, args: &mut RpcArgs<'_>) -> Result<(), RpcError> {
        self(args)
    }
}

/// The table of session-scoped procedures.
///
/// Built mutably during startup, then typically wrapped in an [`Arc`] and
/// shared read-only with the dispatcher.
#[derive(Default)]
pub struct RpcRegistry {
    handlers: HashMap<u8, Arc<dyn RpcHandler>>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `rpc_id`. Ids are single-occupancy.
    pub fn register<H>(&mut self, rpc_id: u8, handler: H) -> Result<(), RpcError>
    where
        H: RpcHandler + 'static,
    {
        if self.handlers.contains_key(&rpc_id) {
            return Err(RpcError::DuplicateRegistration { rpc_id });
        }
        self.handlers.insert(rpc_id, Arc::new(handler));
        Ok(())
    }

    /// Look up and run the handler for `rpc_id`.
    pub fn invoke(&self, rpc_id: u8, args: &mut RpcArgs<'_>) -> Result<(), RpcError> {
        let handler = self
            .handlers
            .get(&rpc_id)
            .ok_or(RpcError::UnknownRpc { rpc_id })?;
        handler.invoke(args)
    }

    /// Whether a handler exists for `rpc_id`.
    pub fn contains(&self, rpc_id: u8) -> bool {
        self.handlers.contains_key(&rpc_id)
    }
}

/// The table of instance-bound procedures, keyed by view id.
///
/// Unlike [`RpcRegistry`], views come and go as replicated objects spawn
/// and despawn, so this table is interior-mutable.
#[derive(Default)]
pub struct ViewRegistry {
    views: RwLock<HashMap<u16, ViewEntry>>,
}

#[derive(Default)]
struct ViewEntry {
    handlers: HashMap<(u8, u8), Arc<dyn RpcHandler>>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `view_id` addressable. Idempotent.
    pub fn add_view(&self, view_id: u16) {
        let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
        views.entry(view_id).or_default();
    }

    /// Remove a view and all its handlers.
    pub fn remove_view(&self, view_id: u16) {
        let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
        views.remove(&view_id);
    }

    /// Register a handler for `(rpc_id, instance_id)` on an existing view.
    pub fn register<H>(
        &self,
        view_id: u16,
        rpc_id: u8,
        instance_id: u8,
        handler: H,
    ) -> Result<(), RpcError>
    where
        H: RpcHandler + 'static,
    {
        let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
        let entry = views
            .get_mut(&view_id)
            .ok_or(RpcError::TargetNotFound { view_id })?;
        if entry.handlers.contains_key(&(rpc_id, instance_id)) {
            return Err(RpcError::DuplicateRegistration { rpc_id });
        }
        entry.handlers.insert((rpc_id, instance_id), Arc::new(handler));
        Ok(())
    }

    /// Dispatch an instance call. A missing view and a missing handler are
    /// distinct failures so callers can report them differently.
    pub fn invoke(
        &self,
        view_id: u16,
        rpc_id: u8,
        instance_id: u8,
        args: &mut RpcArgs<'_>,
    ) -> Result<(), RpcError> {
        // Clone the handler out so user code never runs under the lock.
        let handler = {
            let views = self.views.read().unwrap_or_else(|e| e.into_inner());
            let entry = views
                .get(&view_id)
                .ok_or(RpcError::TargetNotFound { view_id })?;
            entry
                .handlers
                .get(&(rpc_id, instance_id))
                .ok_or(RpcError::UnknownRpc { rpc_id })?
                .clone()
        };
        handler.invoke(args)
    }

    /// Whether `view_id` is currently addressable.
    pub fn contains_view(&self, view_id: u16) -> bool {
        let views = self.views.read().unwrap_or_else(|e| e.into_inner());
        views.contains_key(&view_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_global_register_and_invoke() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let mut registry = RpcRegistry::new();
        registry
            .register(3, move |args: &mut RpcArgs<'_>| {
                assert_eq!(args.sender, PeerId(7));
                assert_eq!(args.read_u8()?, 42);
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let mut args = RpcArgs::new(PeerId(7), &[42]);
        registry.invoke(3, &mut args).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_global_registration_rejected() {
        let mut registry = RpcRegistry::new();
        registry
            .register(1, |_: &mut RpcArgs<'_>| Ok(()))
            .unwrap();
        let result = registry.register(1, |_: &mut RpcArgs<'_>| Ok(()));
        assert!(matches!(
            result,
            Err(RpcError::DuplicateRegistration { rpc_id: 1 })
        ));
    }

    #[test]
    fn test_unknown_global_rpc_rejected() {
        let registry = RpcRegistry::new();
        let mut args = RpcArgs::new(PeerId(1), &[]);
        let result = registry.invoke(99, &mut args);
        assert!(matches!(result, Err(RpcError::UnknownRpc { rpc_id: 99 })));
    }

    #[test]
    fn test_instance_dispatch_distinguishes_missing_view_from_missing_rpc() {
        let registry = ViewRegistry::new();
        let mut args = RpcArgs::new(PeerId(1), &[]);

        let result = registry.invoke(10, 1, 0, &mut args);
        assert!(matches!(
            result,
            Err(RpcError::TargetNotFound { view_id: 10 })
        ));

        registry.add_view(10);
        let result = registry.invoke(10, 1, 0, &mut args);
        assert!(matches!(result, Err(RpcError::UnknownRpc { rpc_id: 1 })));
    }

    #[test]
    fn test_instance_handlers_keyed_by_rpc_and_instance() {
        let registry = ViewRegistry::new();
        registry.add_view(5);
        registry
            .register(5, 2, 0, |_: &mut RpcArgs<'_>| Ok(()))
            .unwrap();
        // Same rpc id on another instance is a separate slot.
        registry
            .register(5, 2, 1, |_: &mut RpcArgs<'_>| Ok(()))
            .unwrap();
        let result = registry.register(5, 2, 0, |_: &mut RpcArgs<'_>| Ok(()));
        assert!(matches!(
            result,
            Err(RpcError::DuplicateRegistration { rpc_id: 2 })
        ));
    }

    #[test]
    fn test_removed_view_is_unreachable() {
        let registry = ViewRegistry::new();
        registry.add_view(8);
        registry
            .register(8, 1, 0, |_: &mut RpcArgs<'_>| Ok(()))
            .unwrap();
        registry.remove_view(8);
        let mut args = RpcArgs::new(PeerId(1), &[]);
        assert!(matches!(
            registry.invoke(8, 1, 0, &mut args),
            Err(RpcError::TargetNotFound { view_id: 8 })
        ));
    }

    #[test]
    fn test_args_reader_sequences_fields() {
        let mut buf = Vec::new();
        buf.push(7u8);
        buf.extend_from_slice(&512u16.to_le_bytes());
        buf.extend_from_slice(&1.5f32.to_le_bytes());
        buf.extend_from_slice(&3u16.to_le_bytes());
        buf.extend_from_slice(b"abc");

        let mut args = RpcArgs::new(PeerId(2), &buf);
        assert_eq!(args.read_u8().unwrap(), 7);
        assert_eq!(args.read_u16().unwrap(), 512);
        assert_eq!(args.read_f32().unwrap(), 1.5);
        assert_eq!(args.read_string().unwrap(), "abc");
        assert!(args.remaining().is_empty());
    }

    #[test]
    fn test_short_args_surface_as_read_error() {
        let mut args = RpcArgs::new(PeerId(2), &[1]);
        assert!(matches!(args.read_u32(), Err(RpcError::Args(_))));
    }
}
