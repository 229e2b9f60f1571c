//! Host callbacks invoked by guest imports.
//!
//! A callback is stored in one uniform shape, a closure over `&[Word]`,
//! together with the [`Signature`] it was built for. The typed
//! constructors check arity once per call and convert words to native
//! values explicitly, so a width mismatch is visible where the callback
//! is written.

use crate::memory::GuestMemory;
use indexmap::IndexMap;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use wasmgate_core::{Signature, VmError, VmResult, Word};

/// Opaque context a host caller hands through a guest call to the host
/// callbacks that call runs.
///
/// This is where test doubles and per-request state are injected; the
/// VM never looks inside it.
#[derive(Clone, Default)]
pub struct HostContext {
    inner: Option<Arc<dyn Any + Send + Sync>>,
}

impl HostContext {
    /// The empty context
    #[must_use]
    pub fn none() -> Self {
        Self { inner: None }
    }

    /// Wrap a value
    #[must_use]
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Share an existing value
    #[must_use]
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        let inner: Arc<dyn Any + Send + Sync> = value;
        Self { inner: Some(inner) }
    }

    /// Borrow the value if it has type `T`
    #[must_use]
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.inner.as_deref()?.downcast_ref::<T>()
    }

    /// Whether no value was supplied
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.inner.is_none()
    }
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("present", &self.inner.is_some())
            .finish()
    }
}

/// What a host callback sees while the guest is calling it
pub struct CallContext<'a> {
    host: &'a HostContext,
    memory: &'a mut dyn GuestMemory,
}

impl<'a> CallContext<'a> {
    /// Create a call context
    #[must_use]
    pub fn new(host: &'a HostContext, memory: &'a mut dyn GuestMemory) -> Self {
        Self { host, memory }
    }

    /// The injected host context
    #[must_use]
    pub fn host(&self) -> &HostContext {
        self.host
    }

    /// Guest linear memory
    pub fn memory(&mut self) -> &mut dyn GuestMemory {
        self.memory
    }

    /// Copy bytes out of guest memory
    ///
    /// # Errors
    ///
    /// Returns error if the range is out of bounds
    pub fn get_memory(&self, pointer: Word, len: Word) -> VmResult<Vec<u8>> {
        self.memory.read(pointer.u64(), len.u64())
    }

    /// Copy bytes into guest memory
    ///
    /// # Errors
    ///
    /// Returns error if the range is out of bounds
    pub fn set_memory(&mut self, pointer: Word, data: &[u8]) -> VmResult<()> {
        self.memory.write(pointer.u64(), data)
    }

    /// Read a wasm32 word from guest memory
    ///
    /// # Errors
    ///
    /// Returns error if the range is out of bounds
    pub fn get_word(&self, pointer: Word) -> VmResult<Word> {
        self.memory.read_word(pointer.u64())
    }

    /// Write a wasm32 word into guest memory
    ///
    /// # Errors
    ///
    /// Returns error if the range is out of bounds or the word is too wide
    pub fn set_word(&mut self, pointer: Word, word: Word) -> VmResult<()> {
        self.memory.write_word(pointer.u64(), word)
    }
}

type CallbackFn = dyn Fn(&mut CallContext<'_>, &[Word]) -> VmResult<Option<Word>> + Send + Sync;

/// A host function callable from the guest
#[derive(Clone)]
pub struct HostCallback {
    signature: Signature,
    func: Arc<CallbackFn>,
}

fn words<const N: usize>(args: &[Word]) -> VmResult<[Word; N]> {
    <[Word; N]>::try_from(args).map_err(|_| VmError::ArityMismatch {
        name: "host callback".to_string(),
        expected: N,
        actual: args.len(),
    })
}

fn narrow<const N: usize>(args: [Word; N]) -> VmResult<[u32; N]> {
    let mut out = [0u32; N];
    for (slot, word) in out.iter_mut().zip(args) {
        *slot = word.to_u32()?;
    }
    Ok(out)
}

impl HostCallback {
    /// Callback taking `N` words and returning nothing
    #[must_use]
    pub fn void<const N: usize, F>(f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>, [Word; N]) -> VmResult<()> + Send + Sync + 'static,
    {
        Self {
            signature: Signature::void(N),
            func: Arc::new(move |cx: &mut CallContext<'_>, args: &[Word]| {
                f(cx, words::<N>(args)?)?;
                Ok(None)
            }),
        }
    }

    /// Callback taking `N` words and returning one
    #[must_use]
    pub fn word<const N: usize, F>(f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>, [Word; N]) -> VmResult<Word> + Send + Sync + 'static,
    {
        Self {
            signature: Signature::word(N),
            func: Arc::new(move |cx: &mut CallContext<'_>, args: &[Word]| {
                f(cx, words::<N>(args)?).map(Some)
            }),
        }
    }

    /// Adapt a native `u32` function returning nothing.
    ///
    /// Arguments wider than 32 bits fail the call instead of truncating.
    #[must_use]
    pub fn void_u32<const N: usize, F>(f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>, [u32; N]) -> VmResult<()> + Send + Sync + 'static,
    {
        Self::void::<N, _>(move |cx, args| f(cx, narrow(args)?))
    }

    /// Adapt a native `u32` function returning a `u32`
    #[must_use]
    pub fn word_u32<const N: usize, F>(f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>, [u32; N]) -> VmResult<u32> + Send + Sync + 'static,
    {
        Self::word::<N, _>(move |cx, args| f(cx, narrow(args)?).map(Word::from_u32))
    }

    /// The word shape of this callback
    #[must_use]
    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// Invoke the callback
    ///
    /// # Errors
    ///
    /// Returns error on arity mismatch or if the callback fails
    pub fn invoke(&self, cx: &mut CallContext<'_>, args: &[Word]) -> VmResult<Option<Word>> {
        if args.len() != self.signature.params {
            return Err(VmError::ArityMismatch {
                name: "host callback".to_string(),
                expected: self.signature.params,
                actual: args.len(),
            });
        }
        (self.func)(cx, args)
    }
}

impl fmt::Debug for HostCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCallback")
            .field("signature", &self.signature)
            .finish()
    }
}

/// Installed host callbacks keyed by (namespace, name)
#[derive(Debug, Clone, Default)]
pub struct CallbackTable {
    callbacks: IndexMap<(String, String), HostCallback>,
}

impl CallbackTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a callback, replacing any previous one under the same key
    pub fn insert(&mut self, namespace: &str, name: &str, callback: HostCallback) {
        self.callbacks
            .insert((namespace.to_string(), name.to_string()), callback);
    }

    /// Look up a callback
    #[must_use]
    pub fn get(&self, namespace: &str, name: &str) -> Option<&HostCallback> {
        self.callbacks
            .get(&(namespace.to_string(), name.to_string()))
    }

    /// Check whether a callback is installed
    #[must_use]
    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.get(namespace, name).is_some()
    }

    /// Keep only the callbacks for which `keep(namespace, name)` holds
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.callbacks
            .retain(|(namespace, name), _| keep(namespace, name));
    }

    /// Number of installed callbacks
    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Whether no callback is installed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Iterate over `(namespace, name, callback)` in install order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &HostCallback)> {
        self.callbacks
            .iter()
            .map(|((namespace, name), callback)| (namespace.as_str(), name.as_str(), callback))
    }
}
