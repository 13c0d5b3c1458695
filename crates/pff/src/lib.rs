#![doc = include_str!("../README.md")]

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
    rc::Rc,
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;
use tracing::{instrument, warn};

mod block_sig;
mod cache;
mod crc;
mod encode;
pub mod ndb;

#[cfg(test)]
mod test_support;

use cache::{BlockCache, CachedBlock};
use ndb::allocation::{read_allocation_page, RangeList};
use ndb::block::{self, BlockFlags, BlockReadOptions, DataTreeBlock};
use ndb::header::FileHeader;
use ndb::index::{self, BTreePage, DescriptorIndexEntry, IndexKind, OffsetIndexEntry};
use ndb::page::PageType;
use ndb::recovery::{scan_orphans, OrphanEntry};
use ndb::sub_node::{sub_node_map, SubNodeEntry};
use ndb::{FileType, NdbError, PageRef, DESCRIPTOR_ID_ROOT_FOLDER};

pub use cache::{DEFAULT_CACHED_BLOCKS, DEFAULT_CACHED_BYTES};

#[derive(Error, Debug)]
pub enum PffError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to lock file reader")]
    Lock,
    #[error("Not a PFF file: {0}")]
    NotAPffFile(NdbError),
    #[error("Unsupported PFF dialect: {0}")]
    UnsupportedDialect(NdbError),
    #[error("Corrupt file header: {0}")]
    CorruptHeader(NdbError),
    #[error("Corrupt page: {0}")]
    CorruptPage(NdbError),
    #[error("Corrupt index: {0}")]
    CorruptIndex(NdbError),
    #[error("Corrupt block: {0}")]
    CorruptBlock(NdbError),
    #[error("Corrupt sub-node tree: {0}")]
    CorruptSubNodeTree(NdbError),
    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(NdbError),
    #[error("Size mismatch: {0}")]
    SizeMismatch(NdbError),
    #[error("Identifier mismatch: {0}")]
    IdMismatch(NdbError),
    #[error("Decompression failed: {0}")]
    DecompressionFailed(NdbError),
    #[error("Unknown descriptor: 0x{0:X}")]
    UnknownDescriptor(u64),
    #[error("Dangling data identifier: 0x{0:X}")]
    DanglingDataId(u64),
}

impl PffError {
    fn header(err: NdbError) -> Self {
        match err {
            NdbError::Io(err) => Self::Io(err),
            err @ NdbError::InvalidFileSignature(_) => Self::NotAPffFile(err),
            err @ (NdbError::UnsupportedContentType(_)
            | NdbError::UnsupportedDataVersion(_)
            | NdbError::UnsupportedEncryptionType(_)) => Self::UnsupportedDialect(err),
            err => Self::CorruptHeader(err),
        }
    }

    fn index(err: NdbError) -> Self {
        match err {
            NdbError::Io(err) => Self::Io(err),
            err => Self::CorruptIndex(err),
        }
    }

    fn block(err: NdbError) -> Self {
        match err {
            NdbError::Io(err) => Self::Io(err),
            err @ NdbError::InvalidBlockCrc { .. } => Self::ChecksumMismatch(err),
            err @ NdbError::MismatchBlockSize { .. } => Self::SizeMismatch(err),
            err @ NdbError::MismatchBlockId { .. } => Self::IdMismatch(err),
            err @ NdbError::DecompressionFailed(_) => Self::DecompressionFailed(err),
            err => Self::CorruptBlock(err),
        }
    }

    fn sub_node(err: NdbError) -> Self {
        match err {
            NdbError::Io(err) => Self::Io(err),
            NdbError::UnresolvedDataId(data_id) => Self::DanglingDataId(data_id),
            err => Self::CorruptSubNodeTree(err),
        }
    }
}

pub type PffResult<T> = Result<T, PffError>;

/// Diagnostic events surfaced through [`DiagnosticSink`]. All of them are
/// non-fatal; fatal conditions travel through [`PffError`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DiagnosticEvent {
    /// Two index entries carry the same key; the first one seen wins.
    DuplicateIndexKey { index: IndexKind, key: u64 },
    /// A corrupt index subtree was skipped in tolerance mode.
    SkippedIndexBranch { index: IndexKind, offset: u64 },
    /// A page checksum was tolerated.
    PageChecksumMismatch {
        offset: u64,
        stored: u32,
        computed: u32,
    },
    /// An allocation or free map page could not be read during the
    /// unallocated-range sweep.
    SkippedAllocationPage { offset: u64 },
    /// A block checksum was tolerated.
    BlockChecksumMismatch { data_id: u64 },
    /// A block size mismatch was tolerated.
    BlockSizeMismatch { data_id: u64 },
    /// A block back-pointer mismatch was tolerated.
    BlockIdMismatch { data_id: u64 },
    /// A store labeled unencrypted turned out to hold encrypted data; all
    /// further reads decrypt.
    DecryptionForced { data_id: u64 },
}

/// Receiver for non-fatal diagnostics, passed in at open.
pub trait DiagnosticSink {
    fn on_event(&mut self, event: &DiagnosticEvent);
}

impl<T: DiagnosticSink> DiagnosticSink for Rc<RefCell<T>> {
    fn on_event(&mut self, event: &DiagnosticEvent) {
        self.borrow_mut().on_event(event);
    }
}

/// A [`DiagnosticSink`] that keeps every event in memory.
#[derive(Default)]
pub struct EventLog {
    events: Vec<DiagnosticEvent>,
}

impl EventLog {
    pub fn events(&self) -> &[DiagnosticEvent] {
        &self.events
    }
}

impl DiagnosticSink for EventLog {
    fn on_event(&mut self, event: &DiagnosticEvent) {
        self.events.push(event.clone());
    }
}

/// Whether to decrypt stores whose header claims no encryption.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub enum ForceDecryption {
    /// Probe table-bearing descriptors for the table signature and latch
    /// forced decryption when a mislabeled store is detected.
    #[default]
    Auto,
    /// Decrypt every non-internal block with the compressible encoding.
    Enabled,
    /// Never second-guess the header.
    Disabled,
}

#[derive(Clone, Debug)]
pub struct PffOptions {
    /// Downgrade page and block checksum failures (and tolerated size
    /// mismatches) to flags instead of errors.
    pub tolerate_checksum_errors: bool,
    /// Downgrade block back-pointer mismatches to flags instead of errors.
    pub tolerate_id_mismatch: bool,
    pub max_cached_blocks: usize,
    pub max_cached_bytes: u64,
    pub force_decryption: ForceDecryption,
}

impl Default for PffOptions {
    fn default() -> Self {
        Self {
            tolerate_checksum_errors: false,
            tolerate_id_mismatch: false,
            max_cached_blocks: DEFAULT_CACHED_BLOCKS,
            max_cached_bytes: DEFAULT_CACHED_BYTES,
            force_decryption: ForceDecryption::default(),
        }
    }
}

pub trait PffReader: Read + Seek {}

impl<T> PffReader for T where T: Read + Seek {}

/// The first data allocation table page sits at this offset; the rest
/// follow at fixed strides determined by the page's bitmap coverage.
const FIRST_ALLOCATION_TABLE_OFFSET: u64 = 0x4400;

/// An open PFF store.
///
/// A `PffFile` owns the file reader, the parsed header, a bounded block
/// cache and the lazily built orphan list. It is single-threaded by
/// contract: wrap it in a mutex to share across threads.
pub struct PffFile {
    reader: Mutex<Box<dyn PffReader>>,
    header: FileHeader,
    options: PffOptions,
    block_cache: RefCell<BlockCache>,
    decryption_forced: Cell<bool>,
    unallocated_data: RefCell<Option<Rc<RangeList>>>,
    unallocated_pages: RefCell<Option<Rc<RangeList>>>,
    orphans: RefCell<Option<Rc<Vec<OrphanEntry>>>>,
    diagnostics: RefCell<Option<Box<dyn DiagnosticSink>>>,
}

impl PffFile {
    pub fn open(path: impl AsRef<Path>) -> PffResult<Self> {
        Self::open_with_options(path, PffOptions::default())
    }

    #[instrument(skip_all)]
    pub fn open_with_options(path: impl AsRef<Path>, options: PffOptions) -> PffResult<Self> {
        let reader = Box::new(File::open(path)?);
        Self::read_from(reader, options, None)
    }

    pub fn open_with_sink(
        path: impl AsRef<Path>,
        options: PffOptions,
        sink: Box<dyn DiagnosticSink>,
    ) -> PffResult<Self> {
        let reader = Box::new(File::open(path)?);
        Self::read_from(reader, options, Some(sink))
    }

    /// Open a store over any seekable reader.
    pub fn read_from(
        mut reader: Box<dyn PffReader>,
        options: PffOptions,
        sink: Option<Box<dyn DiagnosticSink>>,
    ) -> PffResult<Self> {
        reader.seek(SeekFrom::Start(0))?;
        let header = FileHeader::read(&mut reader).map_err(PffError::header)?;

        let file = Self {
            reader: Mutex::new(reader),
            block_cache: RefCell::new(BlockCache::new(
                options.max_cached_blocks,
                options.max_cached_bytes,
            )),
            decryption_forced: Cell::new(options.force_decryption == ForceDecryption::Enabled),
            unallocated_data: RefCell::new(None),
            unallocated_pages: RefCell::new(None),
            orphans: RefCell::new(None),
            diagnostics: RefCell::new(sink),
            header,
            options,
        };

        // Sanity-load both index roots; the trees themselves stay untouched
        // until something is looked up.
        for (root, kind) in [
            (file.header.descriptor_index_root(), IndexKind::Descriptor),
            (file.header.offset_index_root(), IndexKind::Offset),
        ] {
            let mut guard = file.lock_reader()?;
            BTreePage::read(
                &mut *guard,
                root,
                kind,
                file.header.file_type(),
                file.options.tolerate_checksum_errors,
            )
            .map_err(PffError::index)?;
        }

        Ok(file)
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn file_type(&self) -> FileType {
        self.header.file_type()
    }

    pub fn options(&self) -> &PffOptions {
        &self.options
    }

    /// Encrypted reads were forced on a store whose header claims no
    /// encryption. Latched for the lifetime of the open file.
    pub fn decryption_forced(&self) -> bool {
        self.decryption_forced.get()
    }

    /// Drop the store. Outstanding descriptor handles borrow the store and
    /// must be gone before it can close.
    pub fn close(self) {}

    /// Open the well-known root folder descriptor.
    pub fn root_descriptor(&self) -> PffResult<Descriptor<'_>> {
        self.open_descriptor(DESCRIPTOR_ID_ROOT_FOLDER)
    }

    /// Look up `descriptor_id` and assemble its data stream and sub-node
    /// map.
    #[instrument(skip(self))]
    pub fn open_descriptor(&self, descriptor_id: u64) -> PffResult<Descriptor<'_>> {
        let entry = self
            .lookup_descriptor_entry(descriptor_id)?
            .ok_or(PffError::UnknownDescriptor(descriptor_id))?;
        let descriptor = Descriptor::new(self, entry, None);
        descriptor.resolve_layout()?;
        if entry.local_descriptors_id != 0 {
            descriptor.resolve_sub_nodes()?;
        }
        Ok(descriptor)
    }

    /// Restartable in-order traversal of the descriptor index.
    pub fn descriptors(&self) -> Descriptors<'_> {
        Descriptors {
            pff: self,
            stack: Vec::new(),
            last_key: None,
            started: false,
            finished: false,
        }
    }

    /// Restartable in-order traversal of the offset index.
    pub fn offset_entries(&self) -> OffsetEntries<'_> {
        OffsetEntries {
            pff: self,
            stack: Vec::new(),
            last_key: None,
            started: false,
            finished: false,
        }
    }

    /// Descriptors reconstructed from unallocated space. The scan runs on
    /// the first call and is cached; reads of recovered data are always
    /// error-tolerant.
    #[instrument(skip_all)]
    pub fn recovered_descriptors(&self) -> PffResult<RecoveredDescriptors<'_>> {
        let orphans = self.orphan_list()?;
        Ok(RecoveredDescriptors {
            pff: self,
            orphans,
            index: 0,
        })
    }

    /// The merged unallocated data ranges, from the data allocation table
    /// pages.
    pub fn unallocated_data_ranges(&self) -> PffResult<Rc<RangeList>> {
        if let Some(list) = self.unallocated_data.borrow().as_ref() {
            return Ok(list.clone());
        }
        self.gather_unallocated()?;
        Ok(self
            .unallocated_data
            .borrow()
            .as_ref()
            .expect("gathered above")
            .clone())
    }

    /// The merged unallocated page ranges, from the page allocation table
    /// pages. Empty in the 4k dialect, which has no page tables.
    pub fn unallocated_page_ranges(&self) -> PffResult<Rc<RangeList>> {
        if let Some(list) = self.unallocated_pages.borrow().as_ref() {
            return Ok(list.clone());
        }
        self.gather_unallocated()?;
        Ok(self
            .unallocated_pages
            .borrow()
            .as_ref()
            .expect("gathered above")
            .clone())
    }

    fn lock_reader(&self) -> PffResult<MutexGuard<'_, Box<dyn PffReader>>> {
        self.reader.lock().map_err(|_| PffError::Lock)
    }

    fn emit(&self, event: DiagnosticEvent) {
        warn!(?event, "pff diagnostic");
        if let Some(sink) = self.diagnostics.borrow_mut().as_mut() {
            sink.on_event(&event);
        }
    }

    fn lookup_descriptor_entry(
        &self,
        descriptor_id: u64,
    ) -> PffResult<Option<DescriptorIndexEntry>> {
        let mut guard = self.lock_reader()?;
        index::lookup_descriptor(
            &mut *guard,
            self.header.file_type(),
            self.header.descriptor_index_root(),
            descriptor_id,
            self.options.tolerate_checksum_errors,
        )
        .map_err(PffError::index)
    }

    fn lookup_offset_entry(&self, data_id: u64) -> PffResult<Option<OffsetIndexEntry>> {
        let mut guard = self.lock_reader()?;
        index::lookup_offset(
            &mut *guard,
            self.header.file_type(),
            self.header.offset_index_root(),
            data_id,
            self.options.tolerate_checksum_errors,
        )
        .map_err(PffError::index)
    }

    fn block_read_options(&self, tolerant: bool) -> BlockReadOptions {
        BlockReadOptions {
            tolerate_checksum_errors: tolerant || self.options.tolerate_checksum_errors,
            tolerate_id_mismatch: tolerant || self.options.tolerate_id_mismatch,
        }
    }

    /// Read, validate and decrypt the block stored under `data_id`,
    /// through the cache.
    fn read_block_cached(
        &self,
        data_id: u64,
        descriptor_id: u64,
        file_offset: u64,
        data_size: u32,
        tolerant: bool,
    ) -> PffResult<CachedBlock> {
        if let Some(hit) = self.block_cache.borrow_mut().get(data_id) {
            return Ok(hit);
        }

        let mut block = {
            let mut guard = self.lock_reader()?;
            block::read_block(
                &mut *guard,
                data_id,
                file_offset,
                data_size,
                self.header.file_type(),
                self.block_read_options(tolerant),
            )
            .map_err(PffError::block)?
        };

        if block.flags().contains(BlockFlags::CRC_MISMATCH) {
            self.emit(DiagnosticEvent::BlockChecksumMismatch { data_id });
        }
        if block.flags().contains(BlockFlags::SIZE_MISMATCH) {
            self.emit(DiagnosticEvent::BlockSizeMismatch { data_id });
        }
        if block.flags().contains(BlockFlags::ID_MISMATCH) {
            self.emit(DiagnosticEvent::BlockIdMismatch { data_id });
        }

        let outcome = block::decrypt_block(
            &mut block,
            data_id,
            descriptor_id,
            self.header.encryption_type(),
            self.decryption_forced.get(),
            self.options.force_decryption != ForceDecryption::Disabled,
        );
        if outcome.latch_forced && !self.decryption_forced.get() {
            self.decryption_forced.set(true);
            self.emit(DiagnosticEvent::DecryptionForced { data_id });
        }

        let flags = block.flags();
        let cached = CachedBlock {
            data: block.into_data().into(),
            flags,
        };
        self.block_cache
            .borrow_mut()
            .insert(data_id, cached.clone());
        Ok(cached)
    }

    fn read_btree_page(&self, page: PageRef, kind: IndexKind) -> PffResult<BTreePage> {
        let mut guard = self.lock_reader()?;
        let page = BTreePage::read(
            &mut *guard,
            page,
            kind,
            self.header.file_type(),
            self.options.tolerate_checksum_errors,
        )
        .map_err(PffError::index)?;
        drop(guard);
        if let Some((stored, computed)) = page.crc_mismatch() {
            self.emit(DiagnosticEvent::PageChecksumMismatch {
                offset: page.trailer().back_pointer(),
                stored,
                computed,
            });
        }
        Ok(page)
    }

    /// Sweep the allocation table chains and populate both unallocated
    /// range lists. Unreadable map pages are skipped with a diagnostic;
    /// recovery is advisory and should see as much of the file as
    /// possible.
    fn gather_unallocated(&self) -> PffResult<()> {
        let file_type = self.header.file_type();
        let page_size = file_type.page_size() as u64;
        let file_size = self.header.file_size();

        let mut data_list = RangeList::new();
        let mut page_list = RangeList::new();

        let data_coverage = file_type.map_bits_size() as u64 * 8 * 64;
        self.sweep_map_chain(
            FIRST_ALLOCATION_TABLE_OFFSET,
            data_coverage,
            file_size,
            PageType::DataAllocationTable,
            &mut data_list,
        )?;

        // The page allocation tables shadow every eighth data table; the 4k
        // dialect does not have them.
        if file_type != FileType::Unicode4k {
            let page_coverage = data_coverage * 8;
            self.sweep_map_chain(
                FIRST_ALLOCATION_TABLE_OFFSET + page_size,
                page_coverage,
                file_size,
                PageType::PageAllocationTable,
                &mut page_list,
            )?;
        }

        *self.unallocated_data.borrow_mut() = Some(Rc::new(data_list));
        *self.unallocated_pages.borrow_mut() = Some(Rc::new(page_list));
        Ok(())
    }

    fn sweep_map_chain(
        &self,
        first_offset: u64,
        coverage: u64,
        file_size: u64,
        page_type: PageType,
        list: &mut RangeList,
    ) -> PffResult<()> {
        let mut offset = first_offset;
        while offset < file_size {
            let page = PageRef {
                back_pointer: offset,
                offset,
            };
            let mut guard = self.lock_reader()?;
            let result = read_allocation_page(
                &mut *guard,
                page,
                self.header.file_type(),
                &[page_type],
                true,
                list,
            );
            drop(guard);
            match result {
                Ok(Some((stored, computed))) => {
                    self.emit(DiagnosticEvent::PageChecksumMismatch {
                        offset,
                        stored,
                        computed,
                    });
                }
                Ok(None) => {}
                Err(NdbError::Io(err)) if err.kind() != io::ErrorKind::UnexpectedEof => {
                    return Err(PffError::Io(err));
                }
                Err(_) => {
                    self.emit(DiagnosticEvent::SkippedAllocationPage { offset });
                }
            }
            offset += coverage;
        }
        Ok(())
    }

    fn orphan_list(&self) -> PffResult<Rc<Vec<OrphanEntry>>> {
        if let Some(orphans) = self.orphans.borrow().as_ref() {
            return Ok(orphans.clone());
        }

        let unallocated = self.unallocated_data_ranges()?;
        let mut guard = self.lock_reader()?;
        let orphans = scan_orphans(
            &mut *guard,
            self.header.file_type(),
            self.header.offset_index_root(),
            &unallocated,
            self.header.encryption_type(),
        )
        .map_err(PffError::index)?;
        drop(guard);

        let orphans = Rc::new(orphans);
        *self.orphans.borrow_mut() = Some(orphans.clone());
        Ok(orphans)
    }
}

/// One leaf of a descriptor's data stream.
#[derive(Copy, Clone, Debug)]
struct StreamLeaf {
    /// Offset of this leaf's first byte within the logical stream.
    stream_offset: u64,
    data_id: u64,
    file_offset: u64,
    data_size: u32,
    logical_size: u64,
}

/// The flattened leaf list of a descriptor's stream.
struct StreamLayout {
    leaves: Vec<StreamLeaf>,
    total_size: u64,
}

/// A handle on one descriptor: its index entry, its reassembled data
/// stream and its sub-node map. Bound to the store it came from.
pub struct Descriptor<'p> {
    pff: &'p PffFile,
    entry: DescriptorIndexEntry,
    recovered: Option<OrphanEntry>,
    layout: RefCell<Option<Rc<StreamLayout>>>,
    sub_nodes: RefCell<Option<Rc<BTreeMap<u64, SubNodeEntry>>>>,
    flags: Rc<Cell<BlockFlags>>,
}

impl<'p> Descriptor<'p> {
    fn new(pff: &'p PffFile, entry: DescriptorIndexEntry, recovered: Option<OrphanEntry>) -> Self {
        Self {
            pff,
            entry,
            recovered,
            layout: RefCell::new(None),
            sub_nodes: RefCell::new(None),
            flags: Rc::new(Cell::new(BlockFlags::empty())),
        }
    }

    pub fn descriptor_id(&self) -> u64 {
        self.entry.descriptor_id
    }

    pub fn parent_descriptor_id(&self) -> u32 {
        self.entry.parent_descriptor_id
    }

    pub fn data_id(&self) -> u64 {
        self.entry.data_id
    }

    pub fn local_descriptors_id(&self) -> u64 {
        self.entry.local_descriptors_id
    }

    /// The descriptor was reconstructed by the recovery scanner rather
    /// than found in the descriptor index.
    pub fn is_recovered(&self) -> bool {
        self.recovered.is_some()
    }

    /// Validation flags accumulated over every block read so far on behalf
    /// of this descriptor.
    pub fn flags(&self) -> BlockFlags {
        self.flags.get()
    }

    fn merge_flags(&self, flags: BlockFlags) {
        self.flags.set(self.flags.get() | flags);
    }

    /// A cursor over the descriptor's logical byte stream.
    pub fn stream(&self) -> PffResult<DataStream<'p>> {
        let layout = self.resolve_layout()?;
        Ok(DataStream {
            pff: self.pff,
            descriptor_id: self.entry.descriptor_id,
            layout,
            flags: self.flags.clone(),
            tolerant: self.recovered.is_some(),
            position: 0,
        })
    }

    /// Open the sub-node `subnode_id` as its own descriptor handle, or
    /// `None` when the sub-node map has no such entry.
    pub fn subnode(&self, subnode_id: u64) -> PffResult<Option<Descriptor<'p>>> {
        let map = self.resolve_sub_nodes()?;
        let Some(entry) = map.get(&subnode_id) else {
            return Ok(None);
        };
        let descriptor = Descriptor::new(
            self.pff,
            DescriptorIndexEntry {
                descriptor_id: subnode_id,
                data_id: entry.data_id,
                local_descriptors_id: entry.nested_subnodes_id,
                parent_descriptor_id: self.entry.descriptor_id as u32,
            },
            None,
        );
        Ok(Some(descriptor))
    }

    /// The sub-node identifiers of this descriptor, in ascending order.
    pub fn subnode_ids(&self) -> PffResult<Vec<u64>> {
        Ok(self.resolve_sub_nodes()?.keys().copied().collect())
    }

    fn resolve_sub_nodes(&self) -> PffResult<Rc<BTreeMap<u64, SubNodeEntry>>> {
        if let Some(map) = self.sub_nodes.borrow().as_ref() {
            return Ok(map.clone());
        }

        let map = if self.entry.local_descriptors_id == 0 {
            BTreeMap::new()
        } else {
            let mut guard = self.pff.lock_reader()?;
            sub_node_map(
                &mut *guard,
                self.pff.header.file_type(),
                self.pff.header.offset_index_root(),
                self.entry.local_descriptors_id,
                self.pff.block_read_options(self.recovered.is_some()),
            )
            .map_err(PffError::sub_node)?
        };

        let map = Rc::new(map);
        *self.sub_nodes.borrow_mut() = Some(map.clone());
        Ok(map)
    }

    /// Resolve the (possibly multi-block) stream into an ordered leaf
    /// list. Block trees are followed here; leaf payloads are only read on
    /// demand, except where the 4k dialect's compression makes the logical
    /// length depend on the block itself.
    fn resolve_layout(&self) -> PffResult<Rc<StreamLayout>> {
        if let Some(layout) = self.layout.borrow().as_ref() {
            return Ok(layout.clone());
        }

        let tolerant = self.recovered.is_some();
        let layout = if let Some(orphan) = self.recovered {
            let cached = self.pff.read_block_cached(
                orphan.data_id,
                self.entry.descriptor_id,
                orphan.file_offset,
                u32::from(orphan.data_size),
                true,
            )?;
            self.merge_flags(cached.flags);
            StreamLayout {
                total_size: cached.data.len() as u64,
                leaves: vec![StreamLeaf {
                    stream_offset: 0,
                    data_id: orphan.data_id,
                    file_offset: orphan.file_offset,
                    data_size: u32::from(orphan.data_size),
                    logical_size: cached.data.len() as u64,
                }],
            }
        } else {
            let root = self.read_indexed_block(self.entry.data_id, tolerant)?;
            // Only internal blocks hold block trees; a plain payload is free
            // to start with the tree tag byte.
            let tree = if ndb::data_id_is_internal(self.entry.data_id) {
                block::parse_data_tree(&root.data, self.pff.header.file_type())
                    .map_err(PffError::block)?
            } else {
                None
            };

            match tree {
                None => {
                    let entry = self.offset_entry(self.entry.data_id)?;
                    StreamLayout {
                        total_size: root.data.len() as u64,
                        leaves: vec![StreamLeaf {
                            stream_offset: 0,
                            data_id: self.entry.data_id,
                            file_offset: entry.file_offset,
                            data_size: u32::from(entry.data_size),
                            logical_size: root.data.len() as u64,
                        }],
                    }
                }
                Some(tree) => self.resolve_tree(tree, tolerant)?,
            }
        };

        let layout = Rc::new(layout);
        *self.layout.borrow_mut() = Some(layout.clone());
        Ok(layout)
    }

    fn resolve_tree(&self, tree: DataTreeBlock, tolerant: bool) -> PffResult<StreamLayout> {
        let mut leaf_ids = Vec::new();
        match tree.level {
            1 => leaf_ids.extend(tree.entries),
            _ => {
                for child_id in tree.entries {
                    let child = self.read_indexed_block(child_id, tolerant)?;
                    let child_tree =
                        block::parse_data_tree(&child.data, self.pff.header.file_type())
                            .map_err(PffError::block)?
                            .ok_or(PffError::CorruptBlock(NdbError::InvalidDataTreeType(
                                child.data.first().copied().unwrap_or(0),
                            )))?;
                    leaf_ids.extend(child_tree.entries);
                }
            }
        }

        let mut leaves = Vec::with_capacity(leaf_ids.len());
        let mut stream_offset = 0_u64;
        for data_id in leaf_ids {
            let entry = self.offset_entry(data_id)?;
            let logical_size = if self.pff.header.file_type().supports_compression() {
                // Compressed leaves advertise their stored size in the
                // offset index; the stream length needs the inflated size.
                let cached = self.pff.read_block_cached(
                    data_id,
                    self.entry.descriptor_id,
                    entry.file_offset,
                    u32::from(entry.data_size),
                    tolerant,
                )?;
                self.merge_flags(cached.flags);
                cached.data.len() as u64
            } else {
                u64::from(entry.data_size)
            };
            leaves.push(StreamLeaf {
                stream_offset,
                data_id,
                file_offset: entry.file_offset,
                data_size: u32::from(entry.data_size),
                logical_size,
            });
            stream_offset += logical_size;
        }

        Ok(StreamLayout {
            leaves,
            total_size: stream_offset,
        })
    }

    fn offset_entry(&self, data_id: u64) -> PffResult<OffsetIndexEntry> {
        self.pff
            .lookup_offset_entry(data_id)?
            .ok_or(PffError::DanglingDataId(data_id))
    }

    fn read_indexed_block(&self, data_id: u64, tolerant: bool) -> PffResult<CachedBlock> {
        let entry = self.offset_entry(data_id)?;
        let cached = self.pff.read_block_cached(
            data_id,
            self.entry.descriptor_id,
            entry.file_offset,
            u32::from(entry.data_size),
            tolerant,
        )?;
        self.merge_flags(cached.flags);
        Ok(cached)
    }
}

/// A lazy, restartable cursor over a descriptor's logical byte stream.
///
/// Multiple streams over the same descriptor share the store's block cache
/// but hold independent positions.
pub struct DataStream<'p> {
    pff: &'p PffFile,
    descriptor_id: u64,
    layout: Rc<StreamLayout>,
    flags: Rc<Cell<BlockFlags>>,
    tolerant: bool,
    position: u64,
}

impl DataStream<'_> {
    /// Total logical length in bytes.
    pub fn len(&self) -> u64 {
        self.layout.total_size
    }

    pub fn is_empty(&self) -> bool {
        self.layout.total_size == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn seek(&mut self, offset: u64) {
        self.position = offset.min(self.layout.total_size);
    }

    /// Read up to `buf.len()` bytes starting at `offset`, without moving
    /// the cursor. Returns the number of bytes read; zero at end of
    /// stream.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> PffResult<usize> {
        if offset >= self.layout.total_size || buf.is_empty() {
            return Ok(0);
        }

        let mut copied = 0_usize;
        let mut position = offset;

        let mut leaf_index = self
            .layout
            .leaves
            .partition_point(|leaf| leaf.stream_offset + leaf.logical_size <= position);

        while copied < buf.len() && leaf_index < self.layout.leaves.len() {
            let leaf = &self.layout.leaves[leaf_index];
            let data = self.read_leaf(leaf)?;

            // A tolerated size mismatch can leave a leaf shorter than the
            // layout promised; the shortfall reads as absent bytes.
            let skip = position.saturating_sub(leaf.stream_offset) as usize;
            if skip >= data.len() {
                position = leaf.stream_offset + leaf.logical_size;
                leaf_index += 1;
                continue;
            }

            let take = (buf.len() - copied).min(data.len() - skip);
            buf[copied..copied + take].copy_from_slice(&data[skip..skip + take]);
            copied += take;
            position += take as u64;
            leaf_index += 1;
        }

        Ok(copied)
    }

    /// Read from the cursor position, advancing it.
    pub fn read_into(&mut self, buf: &mut [u8]) -> PffResult<usize> {
        let count = self.read_at(self.position, buf)?;
        self.position += count as u64;
        Ok(count)
    }

    /// Read the whole stream into one buffer.
    pub fn read_to_vec(&self) -> PffResult<Vec<u8>> {
        let mut data = vec![0_u8; self.layout.total_size as usize];
        let count = self.read_at(0, &mut data)?;
        data.truncate(count);
        Ok(data)
    }

    fn read_leaf(&self, leaf: &StreamLeaf) -> PffResult<Arc<[u8]>> {
        let cached = self.pff.read_block_cached(
            leaf.data_id,
            self.descriptor_id,
            leaf.file_offset,
            leaf.data_size,
            self.tolerant,
        )?;
        self.flags.set(self.flags.get() | cached.flags);
        Ok(cached.data)
    }
}

/// In-order iterator over the descriptor index. Yields descriptors in
/// ascending identifier order; the same store always yields the same
/// sequence.
pub struct Descriptors<'p> {
    pff: &'p PffFile,
    stack: Vec<(BTreePage, usize)>,
    last_key: Option<u64>,
    started: bool,
    finished: bool,
}

impl<'p> Descriptors<'p> {
    fn push_page(&mut self, page: PageRef) -> PffResult<()> {
        if self.stack.len() >= usize::from(index::MAX_INDEX_DEPTH) {
            return Err(PffError::index(NdbError::IndexDepthExceeded(
                index::MAX_INDEX_DEPTH,
            )));
        }
        let page = self.pff.read_btree_page(page, IndexKind::Descriptor)?;
        self.stack.push((page, 0));
        Ok(())
    }
}

impl<'p> Iterator for Descriptors<'p> {
    type Item = PffResult<Descriptor<'p>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if !self.started {
            self.started = true;
            if let Err(err) = self.push_page(self.pff.header.descriptor_index_root()) {
                self.finished = true;
                return Some(Err(err));
            }
        }

        let file_type = self.pff.header.file_type();

        loop {
            let Some((page, cursor)) = self.stack.last_mut() else {
                self.finished = true;
                return None;
            };

            if *cursor >= page.entry_count() {
                self.stack.pop();
                continue;
            }

            let index = *cursor;
            *cursor += 1;

            if page.is_leaf() {
                let entry = match page.descriptor_entry(index, file_type) {
                    Ok(entry) => entry,
                    Err(err) => {
                        self.finished = true;
                        return Some(Err(PffError::index(err)));
                    }
                };

                // Keys are unique by format contract; the first entry seen
                // under a key wins.
                if self.last_key == Some(entry.descriptor_id) {
                    self.pff.emit(DiagnosticEvent::DuplicateIndexKey {
                        index: IndexKind::Descriptor,
                        key: entry.descriptor_id,
                    });
                    continue;
                }
                self.last_key = Some(entry.descriptor_id);

                return Some(Ok(Descriptor::new(self.pff, entry, None)));
            }

            let child = match page.branch_entry(index, file_type) {
                Ok(entry) => entry.child,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(PffError::index(err)));
                }
            };

            if let Err(err) = self.push_page(child) {
                if self.pff.options.tolerate_checksum_errors {
                    self.pff.emit(DiagnosticEvent::SkippedIndexBranch {
                        index: IndexKind::Descriptor,
                        offset: child.offset,
                    });
                    continue;
                }
                self.finished = true;
                return Some(Err(err));
            }
        }
    }
}

/// In-order iterator over the offset index. Yields entries in ascending
/// (flag-masked) data identifier order.
pub struct OffsetEntries<'p> {
    pff: &'p PffFile,
    stack: Vec<(BTreePage, usize)>,
    last_key: Option<u64>,
    started: bool,
    finished: bool,
}

impl OffsetEntries<'_> {
    fn push_page(&mut self, page: PageRef) -> PffResult<()> {
        if self.stack.len() >= usize::from(index::MAX_INDEX_DEPTH) {
            return Err(PffError::index(NdbError::IndexDepthExceeded(
                index::MAX_INDEX_DEPTH,
            )));
        }
        let page = self.pff.read_btree_page(page, IndexKind::Offset)?;
        self.stack.push((page, 0));
        Ok(())
    }
}

impl Iterator for OffsetEntries<'_> {
    type Item = PffResult<OffsetIndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if !self.started {
            self.started = true;
            if let Err(err) = self.push_page(self.pff.header.offset_index_root()) {
                self.finished = true;
                return Some(Err(err));
            }
        }

        let file_type = self.pff.header.file_type();

        loop {
            let Some((page, cursor)) = self.stack.last_mut() else {
                self.finished = true;
                return None;
            };

            if *cursor >= page.entry_count() {
                self.stack.pop();
                continue;
            }

            let index = *cursor;
            *cursor += 1;

            if page.is_leaf() {
                let entry = match page.offset_entry(index, file_type) {
                    Ok(entry) => entry,
                    Err(err) => {
                        self.finished = true;
                        return Some(Err(PffError::index(err)));
                    }
                };

                let key = IndexKind::Offset.key(entry.data_id);
                if self.last_key == Some(key) {
                    self.pff.emit(DiagnosticEvent::DuplicateIndexKey {
                        index: IndexKind::Offset,
                        key,
                    });
                    continue;
                }
                self.last_key = Some(key);

                return Some(Ok(entry));
            }

            let child = match page.branch_entry(index, file_type) {
                Ok(entry) => entry.child,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(PffError::index(err)));
                }
            };

            if let Err(err) = self.push_page(child) {
                if self.pff.options.tolerate_checksum_errors {
                    self.pff.emit(DiagnosticEvent::SkippedIndexBranch {
                        index: IndexKind::Offset,
                        offset: child.offset,
                    });
                    continue;
                }
                self.finished = true;
                return Some(Err(err));
            }
        }
    }
}

/// Iterator over recovered descriptors, in (data identifier, offset)
/// order.
pub struct RecoveredDescriptors<'p> {
    pff: &'p PffFile,
    orphans: Rc<Vec<OrphanEntry>>,
    index: usize,
}

impl<'p> Iterator for RecoveredDescriptors<'p> {
    type Item = Descriptor<'p>;

    fn next(&mut self) -> Option<Self::Item> {
        let orphan = *self.orphans.get(self.index)?;
        self.index += 1;
        Some(Descriptor::new(
            self.pff,
            DescriptorIndexEntry {
                descriptor_id: orphan.synthetic_descriptor_id,
                data_id: orphan.data_id,
                local_descriptors_id: 0,
                parent_descriptor_id: 0,
            },
            Some(orphan),
        ))
    }
}
