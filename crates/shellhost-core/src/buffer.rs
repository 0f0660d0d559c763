//! Per-window shared-buffer negotiation.
//!
//! Each window moves through `Unbound -> Bound(key) -> Resizing{current,
//! pending} -> Bound(pending)`. A resize allocates a fresh key and only
//! retires the old one once the peer acknowledges the new key; any failure
//! (bad key, timeout, disconnect) releases the pending buffer and leaves the
//! window on its original key. A flip transposes width and height in place.
//!
//! The negotiator never looks at pixels. It only decides which opaque
//! [`BufferKey`] a window currently owns.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::BufferError;
use crate::ids::{BufferKey, WindowId};

/// Bytes per pixel of every negotiated buffer (RGBA).
pub const BYTES_PER_PIXEL: usize = 4;

// =============================================================================
// Configuration
// =============================================================================

/// Buffer negotiation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// How long a resize may wait for the peer's acknowledgment.
    pub resize_timeout_ms: u64,
    /// Size of the out-of-band metadata region allocated per window.
    pub metadata_bytes: usize,
    /// Largest accepted width or height.
    pub max_dimension: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            resize_timeout_ms: 500,
            metadata_bytes: 256,
            max_dimension: 8192,
        }
    }
}

// =============================================================================
// Allocator
// =============================================================================

type Region = Arc<Mutex<Vec<u8>>>;

/// Attached view of a shared region.
///
/// The lock is held only for the duration of one closure call.
#[derive(Debug, Clone)]
pub struct BufferHandle {
    key: BufferKey,
    region: Region,
}

impl BufferHandle {
    #[must_use]
    pub fn key(&self) -> BufferKey {
        self.key
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.region.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the region.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.region.lock())
    }

    /// Write the region.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.region.lock())
    }
}

/// Source of shared pixel and metadata regions.
pub trait SharedBufferAllocator: Send {
    /// Allocate a zeroed region and return its key. Keys are never `0` and
    /// never reissued.
    fn create(&mut self, size_bytes: usize) -> Result<BufferKey, BufferError>;
    /// Attach to a live region.
    fn attach(&self, key: BufferKey) -> Option<BufferHandle>;
    /// Release a region. Returns `false` for unknown keys.
    fn release(&mut self, key: BufferKey) -> bool;
    /// Return memory of released regions to the system; returns bytes freed.
    fn trim(&mut self) -> usize;
    /// Number of live (unreleased) regions.
    fn live_regions(&self) -> usize;
}

/// In-process allocator keeping regions on the heap.
#[derive(Debug)]
pub struct HeapBufferAllocator {
    next_key: u64,
    regions: HashMap<BufferKey, Region>,
    /// Released regions that were still attached somewhere at release time.
    retired: Vec<Region>,
    max_region_bytes: usize,
}

impl Default for HeapBufferAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapBufferAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Allocator refusing regions larger than `max_region_bytes`.
    #[must_use]
    pub fn with_limit(max_region_bytes: usize) -> Self {
        Self {
            next_key: 1,
            regions: HashMap::new(),
            retired: Vec::new(),
            max_region_bytes,
        }
    }
}

impl SharedBufferAllocator for HeapBufferAllocator {
    fn create(&mut self, size_bytes: usize) -> Result<BufferKey, BufferError> {
        if size_bytes > self.max_region_bytes {
            return Err(BufferError::AllocationFailed(size_bytes));
        }
        let key = BufferKey(self.next_key);
        self.next_key += 1;
        self.regions
            .insert(key, Arc::new(Mutex::new(vec![0; size_bytes])));
        Ok(key)
    }

    fn attach(&self, key: BufferKey) -> Option<BufferHandle> {
        self.regions.get(&key).map(|region| BufferHandle {
            key,
            region: Arc::clone(region),
        })
    }

    fn release(&mut self, key: BufferKey) -> bool {
        let Some(region) = self.regions.remove(&key) else {
            return false;
        };
        if Arc::strong_count(&region) > 1 {
            self.retired.push(region);
        }
        true
    }

    fn trim(&mut self) -> usize {
        let mut freed = 0;
        self.retired.retain(|region| {
            if Arc::strong_count(region) == 1 {
                freed += region.lock().len();
                false
            } else {
                true
            }
        });
        freed
    }

    fn live_regions(&self) -> usize {
        self.regions.len()
    }
}

// =============================================================================
// Window buffer state
// =============================================================================

/// The buffer a window currently owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBuffer {
    pub key: BufferKey,
    pub metadata_key: BufferKey,
    pub width: u32,
    pub height: u32,
    pub has_alpha: bool,
    /// Toggled by every flip.
    pub flipped: bool,
}

/// Negotiation state of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Unbound,
    Bound(WindowBuffer),
    Resizing {
        current: WindowBuffer,
        pending: WindowBuffer,
        deadline_ms: u64,
    },
}

impl BufferState {
    /// The key the window paints into right now.
    #[must_use]
    pub fn current_key(&self) -> Option<BufferKey> {
        match self {
            Self::Unbound => None,
            Self::Bound(buf) | Self::Resizing { current: buf, .. } => Some(buf.key),
        }
    }
}

/// A completed resize; the presentation layer should repaint the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepaintRequested {
    pub window: WindowId,
    pub buffer: WindowBuffer,
}

/// A resize that was abandoned; the window kept `restored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeAborted {
    pub window: WindowId,
    pub restored: BufferKey,
    pub discarded: BufferKey,
}

// =============================================================================
// Negotiator
// =============================================================================

/// Owns the window → buffer mapping and drives every allocation.
pub struct BufferNegotiator {
    config: BufferConfig,
    allocator: Box<dyn SharedBufferAllocator>,
    windows: BTreeMap<WindowId, BufferState>,
}

impl std::fmt::Debug for BufferNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferNegotiator")
            .field("config", &self.config)
            .field("windows", &self.windows.len())
            .field("live_regions", &self.allocator.live_regions())
            .finish()
    }
}

impl BufferNegotiator {
    pub fn new(config: BufferConfig, allocator: Box<dyn SharedBufferAllocator>) -> Self {
        Self {
            config,
            allocator,
            windows: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self, window: WindowId) -> Option<&BufferState> {
        self.windows.get(&window)
    }

    /// The bound buffer of `window`, ignoring any pending resize.
    #[must_use]
    pub fn buffer(&self, window: WindowId) -> Option<&WindowBuffer> {
        match self.windows.get(&window)? {
            BufferState::Unbound => None,
            BufferState::Bound(buf) | BufferState::Resizing { current: buf, .. } => Some(buf),
        }
    }

    #[must_use]
    pub fn key_of(&self, window: WindowId) -> Option<BufferKey> {
        self.windows.get(&window).and_then(BufferState::current_key)
    }

    /// Attach to the pixels currently bound to `window`.
    #[must_use]
    pub fn attach(&self, window: WindowId) -> Option<BufferHandle> {
        self.allocator.attach(self.key_of(window)?)
    }

    /// Windows with a bound buffer.
    pub fn bound_windows(&self) -> impl Iterator<Item = (WindowId, BufferKey)> + '_ {
        self.windows
            .iter()
            .filter_map(|(id, state)| state.current_key().map(|key| (*id, key)))
    }

    #[must_use]
    pub fn live_regions(&self) -> usize {
        self.allocator.live_regions()
    }

    fn pixel_bytes(&self, width: u32, height: u32) -> Result<usize, BufferError> {
        if width == 0 || height == 0 || width > self.config.max_dimension || height > self.config.max_dimension
        {
            return Err(BufferError::InvalidDimensions { width, height });
        }
        (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(BYTES_PER_PIXEL))
            .ok_or(BufferError::InvalidDimensions { width, height })
    }

    /// Register a window that has no buffer yet.
    pub fn register(&mut self, window: WindowId) {
        self.windows.entry(window).or_insert(BufferState::Unbound);
    }

    /// Allocate the initial pixel buffer and metadata region for `window`.
    pub fn prepare(
        &mut self,
        window: WindowId,
        width: u32,
        height: u32,
        has_alpha: bool,
    ) -> Result<(BufferKey, BufferKey), BufferError> {
        match self.windows.get(&window) {
            None | Some(BufferState::Unbound) => {}
            Some(_) => return Err(BufferError::AlreadyBound { window }),
        }
        let size = self.pixel_bytes(width, height)?;
        let key = self.allocator.create(size)?;
        let metadata_key = match self.allocator.create(self.config.metadata_bytes) {
            Ok(k) => k,
            Err(err) => {
                self.allocator.release(key);
                return Err(err);
            }
        };

        debug!(window_id = %window, %key, %metadata_key, width, height, "window buffer prepared");
        self.windows.insert(
            window,
            BufferState::Bound(WindowBuffer {
                key,
                metadata_key,
                width,
                height,
                has_alpha,
                flipped: false,
            }),
        );
        Ok((key, metadata_key))
    }

    /// Allocate a buffer of the new size and wait for the peer to adopt it.
    pub fn begin_resize(
        &mut self,
        window: WindowId,
        width: u32,
        height: u32,
        now_ms: u64,
    ) -> Result<BufferKey, BufferError> {
        let current = match self.windows.get(&window) {
            None => return Err(BufferError::UnknownWindow(window)),
            Some(BufferState::Unbound) => return Err(BufferError::NotBound(window)),
            Some(BufferState::Resizing { .. }) => return Err(BufferError::AlreadyResizing(window)),
            Some(BufferState::Bound(buf)) => *buf,
        };
        let size = self.pixel_bytes(width, height)?;
        let key = self.allocator.create(size)?;
        let deadline_ms = now_ms.saturating_add(self.config.resize_timeout_ms);

        debug!(window_id = %window, old_key = %current.key, new_key = %key, width, height, "resize started");
        self.windows.insert(
            window,
            BufferState::Resizing {
                current,
                pending: WindowBuffer {
                    key,
                    width,
                    height,
                    flipped: false,
                    ..current
                },
                deadline_ms,
            },
        );
        Ok(key)
    }

    /// The peer acknowledged `key`; retire the old buffer.
    ///
    /// A mismatched key aborts the resize and keeps the original buffer.
    pub fn complete_resize(
        &mut self,
        window: WindowId,
        key: BufferKey,
    ) -> Result<RepaintRequested, BufferError> {
        let (current, pending) = match self.windows.get(&window) {
            None => return Err(BufferError::UnknownWindow(window)),
            Some(BufferState::Resizing {
                current, pending, ..
            }) => (*current, *pending),
            Some(_) => return Err(BufferError::InvalidKey { window, key }),
        };

        if key != pending.key {
            warn!(window_id = %window, %key, expected = %pending.key, "resize acknowledged with wrong key; aborting");
            self.allocator.release(pending.key);
            self.windows.insert(window, BufferState::Bound(current));
            return Err(BufferError::InvalidKey { window, key });
        }

        self.allocator.release(current.key);
        self.windows.insert(window, BufferState::Bound(pending));
        debug!(window_id = %window, %key, "resize completed");
        Ok(RepaintRequested {
            window,
            buffer: pending,
        })
    }

    /// Abort an in-flight resize of `window`, keeping its original buffer.
    pub fn abort_resize(&mut self, window: WindowId) -> Option<ResizeAborted> {
        let Some(BufferState::Resizing {
            current, pending, ..
        }) = self.windows.get(&window).copied()
        else {
            return None;
        };
        self.allocator.release(pending.key);
        self.windows.insert(window, BufferState::Bound(current));
        Some(ResizeAborted {
            window,
            restored: current.key,
            discarded: pending.key,
        })
    }

    /// Abort every resize whose deadline has passed.
    pub fn expire_resizes(&mut self, now_ms: u64) -> Vec<ResizeAborted> {
        let expired: Vec<WindowId> = self
            .windows
            .iter()
            .filter_map(|(id, state)| match state {
                BufferState::Resizing { deadline_ms, .. } if *deadline_ms <= now_ms => Some(*id),
                _ => None,
            })
            .collect();

        expired
            .into_iter()
            .filter_map(|window| {
                let aborted = self.abort_resize(window)?;
                warn!(window_id = %window, key = %aborted.restored, "resize timed out; keeping previous buffer");
                Some(aborted)
            })
            .collect()
    }

    /// Earliest pending resize deadline.
    #[must_use]
    pub fn next_resize_deadline(&self) -> Option<u64> {
        self.windows
            .values()
            .filter_map(|state| match state {
                BufferState::Resizing { deadline_ms, .. } => Some(*deadline_ms),
                _ => None,
            })
            .min()
    }

    /// Rotate the bound buffer by swapping its logical dimensions.
    pub fn flip(
        &mut self,
        window: WindowId,
        new_width: u32,
        new_height: u32,
    ) -> Result<WindowBuffer, BufferError> {
        let buf = match self.windows.get_mut(&window) {
            None => return Err(BufferError::UnknownWindow(window)),
            Some(BufferState::Unbound) => return Err(BufferError::NotBound(window)),
            Some(BufferState::Resizing { .. }) => return Err(BufferError::AlreadyResizing(window)),
            Some(BufferState::Bound(buf)) => buf,
        };
        if new_width != buf.height || new_height != buf.width {
            return Err(BufferError::NotTranspose {
                from_w: buf.width,
                from_h: buf.height,
                to_w: new_width,
                to_h: new_height,
            });
        }
        buf.width = new_width;
        buf.height = new_height;
        buf.flipped = !buf.flipped;
        debug!(window_id = %window, key = %buf.key, new_width, new_height, "buffer flipped");
        Ok(*buf)
    }

    /// Drop every key held by `window`, including a pending resize.
    ///
    /// Returns the number of regions released.
    pub fn release_window(&mut self, window: WindowId) -> usize {
        let Some(state) = self.windows.remove(&window) else {
            return 0;
        };
        let keys: Vec<BufferKey> = match state {
            BufferState::Unbound => Vec::new(),
            BufferState::Bound(buf) => vec![buf.key, buf.metadata_key],
            BufferState::Resizing {
                current, pending, ..
            } => vec![current.key, current.metadata_key, pending.key],
        };
        let released = keys.iter().filter(|k| self.allocator.release(**k)).count();
        debug!(window_id = %window, released, "window buffers released");
        released
    }

    /// Give freed memory back to the system.
    pub fn trim(&mut self) -> usize {
        let freed = self.allocator.trim();
        if freed > 0 {
            debug!(freed_bytes = freed, "buffer allocator trimmed");
        }
        freed
    }
}

// =============================================================================
// Tests
// =============================================================================
