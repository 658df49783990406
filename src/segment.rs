//! Shared-memory segment lifecycle and the initialization handshake
//!
//! The segment starts with a 0x30-byte header: a state byte, a random
//! non-zero signature, a +1 sequence, a 16-bit checksum, and a reserved
//! block. The first process to claim the state byte zeroes the payload,
//! writes the validity signature, creates the per-container semaphores,
//! and populates every scalar's default; everyone else waits briefly for
//! an in-progress initializer, validates the header, and merely reopens
//! the semaphores.

use std::fs::File;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::shm_open;
use nix::sys::stat::Mode;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, warn};

use crate::access::Payload;
use crate::config::{HEADER_SIZE, INIT_WAIT_MS};
use crate::error::{Result, StoreError};
use crate::layout::{Directory, LayoutNode, NodeKind};
use crate::schema::DefaultValue;
use crate::sem::{NamedSemaphore, SemAllocator};

/// Header state byte: segment never initialized.
pub const STATE_UNSET: u8 = 0x00;
/// Header state byte: a first writer is initializing.
pub const STATE_IN_PROGRESS: u8 = 0x5A;
/// Header state byte: header and payload are valid.
pub const STATE_VALID: u8 = 0xA5;

/// Random signature bytes, each in [0x01, 0xFE].
const SIGNATURE_RANGE: std::ops::Range<u32> = 1..20;
/// +1 sequence seeded by the last signature byte.
const SEQUENCE_RANGE: std::ops::Range<u32> = 20..30;
/// Little-endian 16-bit checksum of bytes 1..=29 plus the seed constant.
const CHECKSUM_OFFSET: u32 = 30;
const CHECKSUM_SEED: u16 = 0x00A5;
/// Reserved block for the initialization-semaphore handle.
const INIT_RESERVE_OFFSET: u32 = 0x20;
const INIT_RESERVE_LEN: u32 = 0x10;

/// A named POSIX shared-memory object, sized and mapped read-write.
#[derive(Debug)]
pub struct SharedSegment {
    name: String,
    mmap: MmapMut,
    _file: File,
}

unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Open or create the named segment and size it to `size` bytes.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        if name.is_empty() {
            return Err(StoreError::segment("segment name cannot be empty"));
        }
        if size < HEADER_SIZE as usize {
            return Err(StoreError::segment(format!(
                "segment size {} is smaller than the header",
                size
            )));
        }

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        )
        .map_err(|e| StoreError::segment(format!("shm_open({}) failed: {}", name, e)))?;
        let file = File::from(fd);

        let metadata = file
            .metadata()
            .map_err(|e| StoreError::segment_io(e, "Failed to stat shared memory object"))?;
        if metadata.len() != size as u64 {
            nix::unistd::ftruncate(&file, size as i64).map_err(|e| {
                StoreError::segment(format!("ftruncate to {} failed: {}", size, e))
            })?;
        }

        let mmap = unsafe {
            MmapOptions::new()
                .len(size)
                .map_mut(&file)
                .map_err(|e| StoreError::segment_io(e, "Failed to map shared memory object"))?
        };

        Ok(Self {
            name: name.to_string(),
            mmap,
            _file: file,
        })
    }

    /// Segment name as passed to `shm_open`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.mmap.len()
    }

    /// Raw view of the mapped bytes (header included).
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    /// Get a mutable base pointer without requiring `&mut self`
    ///
    /// # Safety
    /// Concurrent access is coordinated by the per-container semaphores.
    pub unsafe fn as_mut_ptr_unsafe(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// Typed accessor view over the whole mapping.
    pub(crate) fn payload(&self) -> Payload {
        unsafe { Payload::new(self.as_mut_ptr_unsafe(), self.mmap.len()) }
    }
}

/// Run the initialization handshake against a mapped segment. Binds a
/// semaphore to every directory node and returns whether this call
/// performed the first-writer initialization.
pub(crate) fn attach(
    payload: &Payload,
    directory: &mut Directory,
    init_sem: &NamedSemaphore,
) -> Result<bool> {
    let state = payload.atomic_u8(0);
    loop {
        match state.load(Ordering::Acquire) {
            STATE_VALID => {
                if validate_header(payload) {
                    bind_semaphores(directory)?;
                    return Ok(false);
                }
                warn!(segment_state = STATE_VALID, "header failed validation, rewriting defaults");
                if state
                    .compare_exchange(
                        STATE_VALID,
                        STATE_IN_PROGRESS,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    first_writer(payload, directory, init_sem)?;
                    return Ok(true);
                }
            }
            STATE_IN_PROGRESS => {
                std::thread::sleep(Duration::from_millis(1));
                match init_sem.timed_wait(Duration::from_millis(INIT_WAIT_MS)) {
                    Ok(()) => {
                        // Wake any other waiters behind us
                        let _ = init_sem.post();
                    }
                    Err(err) => {
                        warn!("timed out waiting for segment initialization: {}", err);
                    }
                }
                // If the initializer stalled, re-arm the claim race: reset
                // the state byte so the unset arm's CAS below grants the
                // first-writer path to exactly one waiter
                let _ = state.compare_exchange(
                    STATE_IN_PROGRESS,
                    STATE_UNSET,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            current => {
                // Unset (or corrupt) state: race to claim initialization
                if state
                    .compare_exchange(
                        current,
                        STATE_IN_PROGRESS,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    first_writer(payload, directory, init_sem)?;
                    return Ok(true);
                }
            }
        }
    }
}

/// Check the validity signature of a header claiming to be initialized.
pub(crate) fn validate_header(payload: &Payload) -> bool {
    let mut sum = CHECKSUM_SEED;
    for off in SIGNATURE_RANGE {
        let byte = payload.read_u8(off);
        if byte == 0x00 || byte == 0xFF {
            return false;
        }
        sum = sum.wrapping_add(byte as u16);
    }
    let mut prev = payload.read_u8(SIGNATURE_RANGE.end - 1);
    for off in SEQUENCE_RANGE {
        let byte = payload.read_u8(off);
        if byte != prev.wrapping_add(1) {
            return false;
        }
        sum = sum.wrapping_add(byte as u16);
        prev = byte;
    }
    payload.read_u8(CHECKSUM_OFFSET) == sum as u8
        && payload.read_u8(CHECKSUM_OFFSET + 1) == (sum >> 8) as u8
}

fn first_writer(
    payload: &Payload,
    directory: &mut Directory,
    init_sem: &NamedSemaphore,
) -> Result<()> {
    // State byte is already IN_PROGRESS, claimed by the caller
    payload.fill(INIT_RESERVE_OFFSET, INIT_RESERVE_LEN, 0);
    payload.fill(HEADER_SIZE, payload.len() as u32 - HEADER_SIZE, 0);

    write_signature(payload);
    bind_semaphores(directory)?;
    write_defaults(payload, directory.root());

    payload.atomic_u8(0).store(STATE_VALID, Ordering::Release);
    init_sem.post()?;
    debug!("segment initialized with defaults");
    Ok(())
}

fn write_signature(payload: &Payload) {
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let mut rng = StdRng::seed_from_u64(seed);

    let mut sum = CHECKSUM_SEED;
    let mut last = 0u8;
    for off in SIGNATURE_RANGE {
        let byte: u8 = rng.gen_range(0x01..=0xFE);
        payload.write_u8(off, byte);
        sum = sum.wrapping_add(byte as u16);
        last = byte;
    }
    for off in SEQUENCE_RANGE {
        last = last.wrapping_add(1);
        payload.write_u8(off, last);
        sum = sum.wrapping_add(last as u16);
    }
    payload.write_u8(CHECKSUM_OFFSET, sum as u8);
    payload.write_u8(CHECKSUM_OFFSET + 1, (sum >> 8) as u8);
}

/// Bind a semaphore to every node: containers own one each, allocated in
/// traversal order; scalars inherit their nearest container's.
fn bind_semaphores(directory: &mut Directory) -> Result<()> {
    let mut alloc = SemAllocator::new();
    bind_node(directory.root_mut(), None, &mut alloc)
}

fn bind_node(
    node: &mut LayoutNode,
    parent: Option<&Arc<NamedSemaphore>>,
    alloc: &mut SemAllocator,
) -> Result<()> {
    if node.kind().is_container() {
        let sem = alloc.open_next()?;
        node.sem = Some(Arc::clone(&sem));
        for child in &mut node.children {
            bind_node(child, Some(&sem), alloc)?;
        }
    } else {
        node.sem = parent.cloned();
    }
    Ok(())
}

fn write_defaults(payload: &Payload, node: &LayoutNode) {
    if node.kind().is_container() {
        for child in node.children() {
            write_defaults(payload, child);
        }
        return;
    }
    let Some(default) = &node.default else { return };
    match default {
        DefaultValue::Float(v) => payload.write_f64(node.offset(), *v),
        DefaultValue::Bool(v) => payload.write_u8(node.offset(), if *v { 0xFF } else { 0x00 }),
        DefaultValue::Str(s) => payload.write_cstr(node.offset(), node.size(), s),
        DefaultValue::Int(v) => match node.kind() {
            NodeKind::Int64 => payload.write_u64(node.offset(), *v as u64),
            NodeKind::Int32 => payload.write_u32(node.offset(), *v as u32),
            NodeKind::Int16 => payload.write_u16(node.offset(), *v as u16),
            NodeKind::Int8 => payload.write_u8(node.offset(), *v as u8),
            _ => {}
        },
    }
}

/// Open up world access on `/dev/shm` entries so cooperating processes
/// running as different users can attach to segments and semaphores.
pub(crate) fn normalize_shm_permissions() {
    use std::os::unix::fs::PermissionsExt;

    let entries = match std::fs::read_dir("/dev/shm") {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.permissions().mode() & 0o002 == 0 {
            if let Err(err) =
                std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(0o666))
            {
                debug!("could not normalize permissions on {:?}: {}", entry.path(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::plan;
    use crate::schema::SchemaNode;
    use serde_json::json;

    fn test_directory() -> Directory {
        let def = json!({
            "count": { "type": "int", "size": 4, "defaultValue": 7 },
            "label": { "type": "string", "size": 8, "defaultValue": "hi" },
            "ratio": { "type": "float", "defaultValue": 0.25 },
        });
        plan(&SchemaNode::parse_root(&def).unwrap())
    }

    fn scratch_payload(len: usize) -> (Vec<u8>, Payload) {
        let mut buf = vec![0u8; len];
        let payload = unsafe { Payload::new(buf.as_mut_ptr(), len) };
        (buf, payload)
    }

    fn unique_init_sem(tag: &str) -> NamedSemaphore {
        let name = format!("/shmstore_seg_test_{}_{}", tag, std::process::id());
        NamedSemaphore::create_or_open(&name, 0).unwrap()
    }

    #[test]
    fn test_signature_round_trip() {
        let (_buf, payload) = scratch_payload(64);
        write_signature(&payload);
        assert!(validate_header(&payload));

        for off in 1..20 {
            let byte = payload.read_u8(off);
            assert!(byte != 0x00 && byte != 0xFF);
        }
        for off in 20..30 {
            assert_eq!(
                payload.read_u8(off),
                payload.read_u8(off - 1).wrapping_add(1)
            );
        }
    }

    #[test]
    fn test_corrupt_signature_fails_validation() {
        let (_buf, payload) = scratch_payload(64);
        write_signature(&payload);
        payload.write_u8(5, 0xFF);
        assert!(!validate_header(&payload));

        write_signature(&payload);
        payload.write_u8(25, payload.read_u8(25).wrapping_add(1));
        assert!(!validate_header(&payload));

        write_signature(&payload);
        payload.write_u8(30, payload.read_u8(30).wrapping_add(1));
        assert!(!validate_header(&payload));
    }

    #[test]
    fn test_first_attach_initializes_defaults() {
        let mut dir = test_directory();
        let (_buf, payload) = scratch_payload(dir.total_size() as usize);
        let init_sem = unique_init_sem("first");

        let initialized = attach(&payload, &mut dir, &init_sem).unwrap();
        assert!(initialized);
        assert_eq!(payload.read_u8(0), STATE_VALID);
        assert!(validate_header(&payload));

        let count = dir.find("count").unwrap();
        assert_eq!(payload.read_u32(count.offset()), 7);
        let label = dir.find("label").unwrap();
        assert_eq!(payload.read_cstr(label.offset(), label.size()), "hi");
        let ratio = dir.find("ratio").unwrap();
        assert_eq!(payload.read_f64(ratio.offset()), 0.25);
    }

    #[test]
    fn test_second_attach_does_not_touch_payload() {
        let mut dir = test_directory();
        let (_buf, payload) = scratch_payload(dir.total_size() as usize);
        let init_sem = unique_init_sem("second");

        assert!(attach(&payload, &mut dir, &init_sem).unwrap());

        let count = dir.find("count").unwrap();
        payload.write_u32(count.offset(), 99);
        let before = payload.snapshot();

        let mut dir2 = test_directory();
        let initialized = attach(&payload, &mut dir2, &init_sem).unwrap();
        assert!(!initialized);
        assert_eq!(payload.snapshot(), before);
    }

    #[test]
    fn test_semaphore_binding_covers_every_node() {
        let def = json!({
            "top": { "type": "int", "size": 4, "defaultValue": 0 },
            "group": {
                "type": "unit",
                "inner": { "type": "float", "defaultValue": 0.0 },
            },
            "list": {
                "type": "array",
                "0": { "type": "int", "size": 2, "defaultValue": 0 },
                "1": { "type": "int", "size": 2, "defaultValue": 0 },
            },
        });
        let mut dir = plan(&SchemaNode::parse_root(&def).unwrap());
        let (_buf, payload) = scratch_payload(dir.total_size() as usize);
        let init_sem = unique_init_sem("bind");
        attach(&payload, &mut dir, &init_sem).unwrap();

        let mut missing = 0;
        dir.root().visit(&mut |node| {
            if node.semaphore().is_none() {
                missing += 1;
            }
        });
        assert_eq!(missing, 0);

        // Scalars share their container's semaphore; containers differ
        let root_sem = dir.root().semaphore().unwrap().name().to_string();
        let top_sem = dir.find("top").unwrap().semaphore().unwrap().name().to_string();
        assert_eq!(root_sem, top_sem);

        let group_sem = dir.find("group").unwrap().semaphore().unwrap().name().to_string();
        let inner_sem = dir.find("group/inner").unwrap().semaphore().unwrap().name();
        assert_eq!(group_sem, inner_sem);
        assert_ne!(group_sem, root_sem);

        // Array children bind exactly like unit children
        let list_sem = dir.find("list").unwrap().semaphore().unwrap().name().to_string();
        let elem_sem = dir.find("list/1").unwrap().semaphore().unwrap().name();
        assert_eq!(list_sem, elem_sem);
        assert_ne!(list_sem, group_sem);
    }

    #[test]
    fn test_stalled_initializer_takeover_has_one_winner() {
        let len = test_directory().total_size() as usize;
        let mut buf = vec![0u8; len];
        // A crashed first writer left the claim byte set and never posted
        buf[0] = STATE_IN_PROGRESS;
        let payload = unsafe { Payload::new(buf.as_mut_ptr(), len) };
        let init_sem = unique_init_sem("stalled");

        let winners: Vec<bool> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..3)
                .map(|_| {
                    s.spawn(|| {
                        let mut dir = test_directory();
                        attach(&payload, &mut dir, &init_sem).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(
            winners.iter().filter(|&&w| w).count(),
            1,
            "exactly one waiter takes over: {:?}",
            winners
        );
        assert_eq!(payload.read_u8(0), STATE_VALID);
        assert!(validate_header(&payload));
        let dir = test_directory();
        let count = dir.find("count").unwrap();
        assert_eq!(payload.read_u32(count.offset()), 7);
    }

    #[test]
    fn test_segment_open_sizes_and_maps() {
        let name = format!("/shmstore_seg_open_{}", std::process::id());
        let segment = SharedSegment::open(&name, 4096).unwrap();
        assert_eq!(segment.size(), 4096);
        assert_eq!(segment.name(), name);

        // Reopening with the same size keeps the mapping usable
        let again = SharedSegment::open(&name, 4096).unwrap();
        assert_eq!(again.size(), 4096);

        let _ = nix::sys::mman::shm_unlink(name.as_str());
    }
}
