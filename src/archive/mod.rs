//! A file system stored in a single file.
//!
//! An archive keeps a tree of directories and files inside one host file
//! divided into blocks of equal size. The first block of the host file
//! holds the header. All other blocks are addressed by their index with
//! index zero being the first block after the header.
//!
//! Blocks are either used by the unused map that tracks which blocks are
//! free, by inodes, or by data and pointer blocks of inodes. Each file or
//! directory is an inode. Small content is kept in the inode block itself.
//! Larger content lives in a set of pointer trees of varying depth rooted
//! in the inode. Directories are inodes whose content is a list of packed
//! entry records.
//!
//! Every modifying operation of [`Archive`] forms a transaction: all blocks
//! changed by it are written back only if the operation succeeded. If it
//! fails, the changes are dropped and the archive stays as it was.
//!
//! Reading and writing always happens through a cache of recently used
//! blocks, so an archive should be accessed through a single [`Archive`]
//! value only.

pub use self::dir::DirEntry;
pub use self::error::{ArchiveError, FormatError, FsError};
pub use self::inode::InodeKind;
pub use self::unused::LayoutKind;

pub mod block;
pub mod cache;
pub mod dir;
pub mod error;
pub mod geometry;
pub mod inode;
pub mod pool;
pub mod storage;
pub mod superblock;
pub mod unused;
pub mod volume;

use std::fs;
use std::collections::HashSet;
use std::path::Path;
use bytes::Bytes;
use log::{debug, warn};
use serde::Serialize;
use self::cache::CacheStats;
use self::dir::{check_name, Dir};
use self::geometry::InodeContext;
use self::inode::Inode;
use self::pool::Pool;
use self::superblock::Superblock;
use self::volume::Volume;


//------------ Default Values ------------------------------------------------

/// The default block size.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// The default maximum file size.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 30;

/// The default number of blocks kept in the cache.
pub const DEFAULT_CACHE_BLOCKS: usize = 256;


//------------ ArchiveOptions ------------------------------------------------

/// The parameters for creating or opening an archive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ArchiveOptions {
    /// The size of a block in bytes.
    ///
    /// Must be a power of two between 64 and 65536.
    pub block_size: u32,

    /// The requested maximum size of a file.
    ///
    /// The actual limit can be somewhat larger, see
    /// [`ArchiveInfo::max_file_size_real`].
    pub max_file_size: u64,

    /// The number of blocks kept in memory.
    pub cache_blocks: usize,

    /// The layout of the unused map.
    ///
    /// This is only used when creating an archive.
    pub layout: LayoutKind,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        ArchiveOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            cache_blocks: DEFAULT_CACHE_BLOCKS,
            layout: LayoutKind::default(),
        }
    }
}


//------------ Archive -------------------------------------------------------

/// An archive of files and directories.
///
/// Paths are byte strings with segments separated by slashes. Empty
/// segments are ignored, so `"a//b/"` is the same as `"a/b"` and the empty
/// path as well as `"/"` refer to the root directory. The segments `"."`
/// and `".."` are rejected.
#[derive(Debug)]
pub struct Archive {
    /// The block layer.
    volume: Volume,

    /// The inode geometry.
    ctx: InodeContext,

    /// Inode values for reuse.
    inodes: Pool<Inode>,

    /// Directory values for reuse.
    dirs: Pool<Dir>,
}

/// # Creating and Opening
///
impl Archive {
    /// Creates a new archive at the given path.
    ///
    /// Fails if the path already exists.
    pub fn create(
        path: impl AsRef<Path>, options: &ArchiveOptions
    ) -> Result<Self, ArchiveError> {
        let file = fs::OpenOptions::new()
            .read(true).write(true).create_new(true)
            .open(path.as_ref())?;
        Self::create_with_file(file, options)
    }

    /// Creates a new archive in the given file.
    ///
    /// Anything in the file will be lost.
    pub fn create_with_file(
        file: fs::File, options: &ArchiveOptions
    ) -> Result<Self, ArchiveError> {
        let superblock = Superblock::new(
            options.block_size, options.max_file_size, options.layout
        )?;
        let ctx = InodeContext::new(
            options.block_size, options.max_file_size
        )?;
        let volume = Volume::create(file, superblock, options.cache_blocks)?;
        let mut res = Archive {
            volume, ctx, inodes: Pool::new(), dirs: Pool::new(),
        };

        let mut root = res.dirs.take();
        let created = root.create(&mut res.volume, &res.ctx);
        let block = root.block();
        res.dirs.give(root);
        created?;
        res.volume.set_root(block);
        res.volume.commit()?;
        debug!(
            "Created archive with block size {} and file size limit {}.",
            options.block_size, res.ctx.max_file_size_real()
        );
        Ok(res)
    }

    /// Opens an existing archive at the given path.
    ///
    /// If `options` are given, the block size and maximum file size
    /// stored in the archive must match them. Otherwise only the cache
    /// size is taken from the options.
    pub fn open(
        path: impl AsRef<Path>, options: Option<&ArchiveOptions>
    ) -> Result<Self, ArchiveError> {
        let file = fs::OpenOptions::new()
            .read(true).write(true)
            .open(path.as_ref())?;
        Self::open_with_file(file, options)
    }

    /// Opens an existing archive in the given file.
    pub fn open_with_file(
        file: fs::File, options: Option<&ArchiveOptions>
    ) -> Result<Self, ArchiveError> {
        let cache_blocks = options.map(|options| {
            options.cache_blocks
        }).unwrap_or(DEFAULT_CACHE_BLOCKS);
        Self::open_volume(file, cache_blocks, options)
    }

    /// Opens an existing archive with whatever parameters it has.
    ///
    /// Only the size of the cache is given.
    pub fn open_with_cache(
        path: impl AsRef<Path>, cache_blocks: usize
    ) -> Result<Self, ArchiveError> {
        let file = fs::OpenOptions::new()
            .read(true).write(true)
            .open(path.as_ref())?;
        Self::open_volume(file, cache_blocks, None)
    }

    fn open_volume(
        file: fs::File,
        cache_blocks: usize,
        options: Option<&ArchiveOptions>,
    ) -> Result<Self, ArchiveError> {
        let volume = Volume::open(file, cache_blocks)?;
        let superblock = volume.superblock();
        if let Some(options) = options {
            if superblock.block_size() != options.block_size {
                return Err(FormatError::Mismatch {
                    field: "block size",
                    expected: options.block_size.into(),
                    found: superblock.block_size().into(),
                }.into())
            }
            if superblock.max_file_size() != options.max_file_size {
                return Err(FormatError::Mismatch {
                    field: "maximum file size",
                    expected: options.max_file_size,
                    found: superblock.max_file_size(),
                }.into())
            }
        }
        let ctx = InodeContext::new(
            superblock.block_size(), superblock.max_file_size()
        )?;
        let mut res = Archive {
            volume, ctx, inodes: Pool::new(), dirs: Pool::new(),
        };

        let root = res.volume.root();
        if root == 0 {
            return Err(ArchiveError::Corrupt("missing root directory"))
        }
        let mut dir = res.dirs.take();
        let opened = dir.open(&mut res.volume, &res.ctx, root);
        res.dirs.give(dir);
        match opened {
            Ok(()) => { }
            Err(FsError::Archive(err)) => return Err(err),
            Err(_) => {
                return Err(ArchiveError::Corrupt("root is not a directory"))
            }
        }
        debug!(
            "Opened archive with {} of {} blocks in use.",
            res.volume.superblock().used(), res.volume.superblock().total()
        );
        Ok(res)
    }

    /// Opens the archive at the given path or creates it if missing.
    pub fn create_or_open(
        path: impl AsRef<Path>, options: &ArchiveOptions
    ) -> Result<Self, ArchiveError> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path, Some(options))
        }
        else {
            Self::create(path, options)
        }
    }
}

/// # Accessing Content
///
impl Archive {
    /// Writes a file with the given content.
    ///
    /// If the file exists, its content is replaced. Otherwise it is created
    /// in an existing directory.
    pub fn put(
        &mut self, path: impl AsRef<[u8]>, data: &[u8]
    ) -> Result<(), FsError> {
        let path = path.as_ref();
        self.transact(|this| {
            let mut dir = this.dirs.take();
            let mut inode = this.inodes.take();
            let res = this.put_with(&mut dir, &mut inode, path, data);
            this.inodes.give(inode);
            this.dirs.give(dir);
            res
        })
    }

    fn put_with(
        &mut self, dir: &mut Dir, inode: &mut Inode, path: &[u8], data: &[u8]
    ) -> Result<(), FsError> {
        let limit = self.ctx.max_file_size_real();
        if data.len() as u64 > limit {
            return Err(ArchiveError::Capacity {
                end: data.len() as u64, limit
            }.into())
        }
        let segments = split_path(path)?;
        let name = self.open_parent(dir, &segments)?;
        check_name(name)?;
        match dir.lookup(&mut self.volume, &self.ctx, name)? {
            Some(entry) => {
                if entry.kind.is_dir() {
                    return Err(FsError::IsADirectory)
                }
                inode.open(&mut self.volume, &self.ctx, entry.child)?;
                if inode.size() > data.len() as u64 {
                    inode.truncate(
                        &mut self.volume, &self.ctx, data.len() as u64
                    )?;
                }
                inode.write_bytes(&mut self.volume, &self.ctx, 0, data)?;
            }
            None => {
                dir.check_insert(&mut self.volume, &self.ctx, name)?;
                inode.create(&mut self.volume, InodeKind::File)?;
                inode.write_bytes(&mut self.volume, &self.ctx, 0, data)?;
                dir.insert(
                    &mut self.volume, &self.ctx,
                    name, InodeKind::File, inode.block()
                )?;
            }
        }
        Ok(())
    }

    /// Returns the entire content of a file.
    pub fn get(&mut self, path: impl AsRef<[u8]>) -> Result<Bytes, FsError> {
        let path = path.as_ref();
        let mut dir = self.dirs.take();
        let mut inode = self.inodes.take();
        let res = self.open_file(&mut dir, &mut inode, path).and_then(|_| {
            let mut content = Vec::new();
            inode.read_all(&mut self.volume, &self.ctx, &mut content)?;
            Ok(Bytes::from(content))
        });
        self.inodes.give(inode);
        self.dirs.give(dir);
        res
    }

    /// Reads part of a file into a buffer.
    ///
    /// Returns the number of bytes read. This is zero if `offset` is at or
    /// beyond the end of the file.
    pub fn read_at(
        &mut self, path: impl AsRef<[u8]>, offset: u64, buf: &mut [u8]
    ) -> Result<usize, FsError> {
        let path = path.as_ref();
        let mut dir = self.dirs.take();
        let mut inode = self.inodes.take();
        let res = self.open_file(&mut dir, &mut inode, path).and_then(|_| {
            Ok(inode.read_bytes(
                &mut self.volume, &self.ctx, offset, buf
            )?.unwrap_or(0))
        });
        self.inodes.give(inode);
        self.dirs.give(dir);
        res
    }

    /// Writes data into an existing file at the given position.
    ///
    /// The file grows if necessary. A gap between the old end of the file
    /// and `offset` reads as zeros.
    pub fn write_at(
        &mut self, path: impl AsRef<[u8]>, offset: u64, data: &[u8]
    ) -> Result<(), FsError> {
        let path = path.as_ref();
        self.transact(|this| {
            let mut dir = this.dirs.take();
            let mut inode = this.inodes.take();
            let res = this.open_file(&mut dir, &mut inode, path).and_then(|_| {
                inode.write_bytes(&mut this.volume, &this.ctx, offset, data)?;
                Ok(())
            });
            this.inodes.give(inode);
            this.dirs.give(dir);
            res
        })
    }

    /// Appends data to a file, creating it if it doesn’t exist yet.
    pub fn append(
        &mut self, path: impl AsRef<[u8]>, data: &[u8]
    ) -> Result<(), FsError> {
        let path = path.as_ref();
        self.transact(|this| {
            let mut dir = this.dirs.take();
            let mut inode = this.inodes.take();
            let res = this.append_with(&mut dir, &mut inode, path, data);
            this.inodes.give(inode);
            this.dirs.give(dir);
            res
        })
    }

    fn append_with(
        &mut self, dir: &mut Dir, inode: &mut Inode, path: &[u8], data: &[u8]
    ) -> Result<(), FsError> {
        let segments = split_path(path)?;
        let name = self.open_parent(dir, &segments)?;
        check_name(name)?;
        match dir.lookup(&mut self.volume, &self.ctx, name)? {
            Some(entry) => {
                if entry.kind.is_dir() {
                    return Err(FsError::IsADirectory)
                }
                inode.open(&mut self.volume, &self.ctx, entry.child)?;
                let end = inode.size();
                inode.write_bytes(&mut self.volume, &self.ctx, end, data)?;
            }
            None => {
                let limit = self.ctx.max_file_size_real();
                if data.len() as u64 > limit {
                    return Err(ArchiveError::Capacity {
                        end: data.len() as u64, limit
                    }.into())
                }
                dir.check_insert(&mut self.volume, &self.ctx, name)?;
                inode.create(&mut self.volume, InodeKind::File)?;
                inode.write_bytes(&mut self.volume, &self.ctx, 0, data)?;
                dir.insert(
                    &mut self.volume, &self.ctx,
                    name, InodeKind::File, inode.block()
                )?;
            }
        }
        Ok(())
    }

    /// Changes the size of an existing file.
    pub fn truncate(
        &mut self, path: impl AsRef<[u8]>, len: u64
    ) -> Result<(), FsError> {
        let path = path.as_ref();
        self.transact(|this| {
            let mut dir = this.dirs.take();
            let mut inode = this.inodes.take();
            let res = this.open_file(&mut dir, &mut inode, path).and_then(|_| {
                inode.truncate(&mut this.volume, &this.ctx, len)?;
                Ok(())
            });
            this.inodes.give(inode);
            this.dirs.give(dir);
            res
        })
    }

    /// Returns the size of a file.
    pub fn len(&mut self, path: impl AsRef<[u8]>) -> Result<u64, FsError> {
        let path = path.as_ref();
        let mut dir = self.dirs.take();
        let mut inode = self.inodes.take();
        let res = self.open_file(
            &mut dir, &mut inode, path
        ).map(|_| inode.size());
        self.inodes.give(inode);
        self.dirs.give(dir);
        res
    }

    /// Binds `inode` to the file at `path`.
    fn open_file(
        &mut self, dir: &mut Dir, inode: &mut Inode, path: &[u8]
    ) -> Result<(), FsError> {
        let entry = self.find(dir, path)?;
        if entry.kind.is_dir() {
            return Err(FsError::IsADirectory)
        }
        inode.open(&mut self.volume, &self.ctx, entry.child)?;
        Ok(())
    }
}

/// # Managing the Namespace
///
impl Archive {
    /// Returns whether something exists at the given path.
    pub fn exists(
        &mut self, path: impl AsRef<[u8]>
    ) -> Result<bool, FsError> {
        match self.kind(path) {
            Ok(_) => Ok(true),
            Err(FsError::NotFound) => Ok(false),
            Err(err) => Err(err)
        }
    }

    /// Returns whether the path refers to a file or a directory.
    pub fn kind(
        &mut self, path: impl AsRef<[u8]>
    ) -> Result<InodeKind, FsError> {
        let path = path.as_ref();
        let mut dir = self.dirs.take();
        let res = self.find(&mut dir, path).map(|entry| entry.kind);
        self.dirs.give(dir);
        res
    }

    /// Creates a new, empty directory.
    pub fn mkdir(&mut self, path: impl AsRef<[u8]>) -> Result<(), FsError> {
        let path = path.as_ref();
        self.transact(|this| {
            let mut parent = this.dirs.take();
            let mut child = this.dirs.take();
            let res = this.mkdir_with(&mut parent, &mut child, path);
            this.dirs.give(child);
            this.dirs.give(parent);
            res
        })
    }

    fn mkdir_with(
        &mut self, parent: &mut Dir, child: &mut Dir, path: &[u8]
    ) -> Result<(), FsError> {
        let segments = split_path(path)?;
        let name = self.open_parent(parent, &segments)?;
        parent.check_insert(&mut self.volume, &self.ctx, name)?;
        child.create(&mut self.volume, &self.ctx)?;
        parent.insert(
            &mut self.volume, &self.ctx,
            name, InodeKind::Directory, child.block()
        )
    }

    /// Returns the entries of a directory in the order they are stored.
    pub fn list(
        &mut self, path: impl AsRef<[u8]>
    ) -> Result<Vec<DirEntry>, FsError> {
        let path = path.as_ref();
        let mut dir = self.dirs.take();
        let res = self.list_with(&mut dir, path);
        self.dirs.give(dir);
        res
    }

    fn list_with(
        &mut self, dir: &mut Dir, path: &[u8]
    ) -> Result<Vec<DirEntry>, FsError> {
        let entry = self.find(dir, path)?;
        dir.open(&mut self.volume, &self.ctx, entry.child)?;
        Ok(dir.entries(&mut self.volume, &self.ctx)?)
    }

    /// Removes a file or an empty directory.
    pub fn remove(&mut self, path: impl AsRef<[u8]>) -> Result<(), FsError> {
        let path = path.as_ref();
        self.transact(|this| {
            let mut parent = this.dirs.take();
            let mut child = this.dirs.take();
            let mut inode = this.inodes.take();
            let res = this.remove_with(
                &mut parent, &mut child, &mut inode, path
            );
            this.inodes.give(inode);
            this.dirs.give(child);
            this.dirs.give(parent);
            res
        })
    }

    fn remove_with(
        &mut self,
        parent: &mut Dir,
        child: &mut Dir,
        inode: &mut Inode,
        path: &[u8],
    ) -> Result<(), FsError> {
        let segments = split_path(path)?;
        let name = self.open_parent(parent, &segments)?;
        let entry = parent.lookup(
            &mut self.volume, &self.ctx, name
        )?.ok_or(FsError::NotFound)?;
        if entry.kind.is_dir() {
            child.open(&mut self.volume, &self.ctx, entry.child)?;
            if !child.is_empty(&mut self.volume, &self.ctx)? {
                return Err(FsError::NotEmpty)
            }
            parent.delete(&mut self.volume, &self.ctx, name)?;
            child.inode_mut().free(&mut self.volume, &self.ctx)?;
        }
        else {
            inode.open(&mut self.volume, &self.ctx, entry.child)?;
            parent.delete(&mut self.volume, &self.ctx, name)?;
            inode.free(&mut self.volume, &self.ctx)?;
        }
        Ok(())
    }

    /// Moves a file or directory to a new path.
    ///
    /// The new path must not exist yet. A directory can’t be moved into
    /// itself or any of its descendants.
    pub fn rename(
        &mut self, from: impl AsRef<[u8]>, to: impl AsRef<[u8]>
    ) -> Result<(), FsError> {
        let (from, to) = (from.as_ref(), to.as_ref());
        self.transact(|this| {
            let mut source = this.dirs.take();
            let mut target = this.dirs.take();
            let res = this.rename_with(&mut source, &mut target, from, to);
            this.dirs.give(target);
            this.dirs.give(source);
            res
        })
    }

    fn rename_with(
        &mut self,
        source: &mut Dir,
        target: &mut Dir,
        from: &[u8],
        to: &[u8],
    ) -> Result<(), FsError> {
        let from = split_path(from)?;
        let to = split_path(to)?;
        let from_name = self.open_parent(source, &from)?;
        let entry = source.lookup(
            &mut self.volume, &self.ctx, from_name
        )?.ok_or(FsError::NotFound)?;
        if entry.kind.is_dir() && to.starts_with(&from) {
            return Err(FsError::InvalidPath)
        }
        let to_name = self.open_parent(target, &to)?;
        if target.block() == source.block() {
            // The deletion below may make room, so only the name is
            // checked here.
            check_name(to_name)?;
            if target.lookup(
                &mut self.volume, &self.ctx, to_name
            )?.is_some() {
                return Err(FsError::Exists)
            }
        }
        else {
            target.check_insert(&mut self.volume, &self.ctx, to_name)?;
        }

        source.delete(&mut self.volume, &self.ctx, from_name)?;

        // Both values may refer to the same directory. Only the one that
        // did the delete is up to date then.
        let target = if target.block() == source.block() {
            source
        }
        else {
            target
        };
        target.insert(
            &mut self.volume, &self.ctx, to_name, entry.kind, entry.child
        )
    }
}

/// # Maintenance
///
impl Archive {
    /// Returns information about the archive.
    pub fn info(&self) -> ArchiveInfo {
        let superblock = self.volume.superblock();
        ArchiveInfo {
            block_size: superblock.block_size(),
            layout: superblock.layout(),
            total_blocks: superblock.total(),
            used_blocks: superblock.used(),
            max_file_size: superblock.max_file_size(),
            max_file_size_real: self.ctx.max_file_size_real(),
            tree_depth: self.ctx.depth(),
            file_len: superblock.file_len(),
            cache: self.volume.cache_stats(),
        }
    }

    /// Returns the largest size a file can have.
    pub fn max_file_size(&self) -> u64 {
        self.ctx.max_file_size_real()
    }

    /// Checks the consistency of the archive.
    ///
    /// Walks the whole directory tree and makes sure that every block is
    /// used exactly once and that the unused map agrees.
    pub fn verify(&mut self) -> Result<ArchiveStats, ArchiveError> {
        let mut dir = self.dirs.take();
        let mut inode = self.inodes.take();
        let res = self.verify_with(&mut dir, &mut inode);
        self.inodes.give(inode);
        self.dirs.give(dir);
        res
    }

    fn verify_with(
        &mut self, dir: &mut Dir, inode: &mut Inode
    ) -> Result<ArchiveStats, ArchiveError> {
        let mut stats = ArchiveStats {
            info: self.info(),
            .. Default::default()
        };
        let total = stats.info.total_blocks;
        let mut seen = HashSet::new();
        let mut tree = Vec::new();
        let mut pending = vec![(self.volume.root(), InodeKind::Directory)];

        while let Some((block, kind)) = pending.pop() {
            self.claim(&mut seen, block, true)?;
            inode.open(&mut self.volume, &self.ctx, block)?;
            if inode.kind() != kind {
                return Err(ArchiveError::Corrupt("entry type mismatch"))
            }
            if !inode.is_inlined() {
                tree.clear();
                self.ctx.collect(&mut self.volume, block, &mut tree)?;
                for &item in &tree {
                    self.claim(&mut seen, item, false)?;
                }
            }
            match kind {
                InodeKind::File => {
                    stats.files += 1;
                    stats.content_bytes += inode.size();
                }
                InodeKind::Directory => {
                    stats.directories += 1;
                    match dir.open(&mut self.volume, &self.ctx, block) {
                        Ok(()) => { }
                        Err(FsError::Archive(err)) => return Err(err),
                        Err(_) => {
                            return Err(ArchiveError::Corrupt(
                                "entry type mismatch"
                            ))
                        }
                    }
                    for entry in dir.entries(&mut self.volume, &self.ctx)? {
                        pending.push((entry.child, entry.kind));
                    }
                }
            }
        }

        let per_group = self.volume.map().blocks_per_group();
        for group in 0..self.volume.map().group_count(total) {
            self.claim(&mut seen, group * per_group, false)?;
        }

        let mut used = 0;
        for index in 0..total {
            let marked = self.volume.is_used(index)?;
            if marked != seen.contains(&index) {
                return Err(ArchiveError::Corrupt(
                    if marked { "leaked block" }
                    else { "block in use marked as free" }
                ))
            }
            if marked {
                used += 1;
            }
        }
        if used != stats.info.used_blocks {
            return Err(ArchiveError::Corrupt("wrong used block count"))
        }
        Ok(stats)
    }

    /// Marks a block as referenced during verification.
    fn claim(
        &mut self, seen: &mut HashSet<u32>, index: u32, is_inode: bool
    ) -> Result<(), ArchiveError> {
        if index >= self.volume.superblock().total() {
            return Err(ArchiveError::Corrupt("block index out of range"))
        }
        if !seen.insert(index) {
            return Err(ArchiveError::Corrupt("block referenced twice"))
        }
        if let Some(marked) = self.volume.is_inode(index)? {
            if marked != is_inode {
                return Err(ArchiveError::Corrupt("wrong block type"))
            }
        }
        Ok(())
    }

    /// Writes all pending changes to disk.
    pub fn flush(&mut self) -> Result<(), ArchiveError> {
        self.volume.flush()
    }

    /// Flushes and closes the archive.
    pub fn close(mut self) -> Result<(), ArchiveError> {
        self.flush()
    }
}

/// # Internal Helpers
///
impl Archive {
    /// Runs a modifying operation as a transaction.
    fn transact<T>(
        &mut self, op: impl FnOnce(&mut Self) -> Result<T, FsError>
    ) -> Result<T, FsError> {
        match op(self) {
            Ok(res) => {
                if let Err(err) = self.volume.commit() {
                    warn!("Failed to commit archive changes: {}", err);
                    self.volume.abort();
                    return Err(err.into())
                }
                Ok(res)
            }
            Err(err) => {
                if !err.is_logical() {
                    warn!("Archive operation failed: {}", err);
                }
                self.volume.abort();
                Err(err)
            }
        }
    }

    /// Finds the entry for a path.
    ///
    /// The root directory is returned as an entry with an empty name.
    fn find(
        &mut self, dir: &mut Dir, path: &[u8]
    ) -> Result<DirEntry, FsError> {
        let segments = split_path(path)?;
        if segments.is_empty() {
            return Ok(DirEntry {
                name: Vec::new(),
                kind: InodeKind::Directory,
                child: self.volume.root(),
            })
        }
        let name = self.open_parent(dir, &segments)?;
        dir.lookup(
            &mut self.volume, &self.ctx, name
        )?.ok_or(FsError::NotFound)
    }

    /// Binds `dir` to the directory containing the last path segment.
    ///
    /// Returns the last segment. Fails with [`FsError::InvalidPath`] if
    /// there are no segments.
    fn open_parent<'p>(
        &mut self, dir: &mut Dir, segments: &[&'p [u8]]
    ) -> Result<&'p [u8], FsError> {
        let (name, parents) = segments.split_last().ok_or(
            FsError::InvalidPath
        )?;
        let mut block = self.volume.root();
        for segment in parents {
            dir.open(&mut self.volume, &self.ctx, block)?;
            let entry = dir.lookup(
                &mut self.volume, &self.ctx, segment
            )?.ok_or(FsError::NotFound)?;
            if !entry.kind.is_dir() {
                return Err(FsError::NotADirectory)
            }
            block = entry.child;
        }
        dir.open(&mut self.volume, &self.ctx, block)?;
        Ok(*name)
    }
}


//------------ ArchiveInfo ---------------------------------------------------

/// Information about an archive.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ArchiveInfo {
    pub block_size: u32,
    pub layout: LayoutKind,
    pub total_blocks: u32,
    pub used_blocks: u32,

    /// The maximum file size requested at creation.
    pub max_file_size: u64,

    /// The maximum file size actually supported.
    ///
    /// This is at least `max_file_size` because the trees of an inode
    /// always cover full blocks.
    pub max_file_size_real: u64,

    /// The depth of the deepest pointer tree.
    pub tree_depth: u32,

    /// The size of the host file.
    pub file_len: u64,

    pub cache: CacheStats,
}


//------------ ArchiveStats --------------------------------------------------

/// The result of verifying an archive.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ArchiveStats {
    #[serde(flatten)]
    pub info: ArchiveInfo,

    /// The number of files.
    pub files: u64,

    /// The number of directories including the root.
    pub directories: u64,

    /// The sum of all file sizes.
    pub content_bytes: u64,
}


//------------ Helpers -------------------------------------------------------

/// Splits a path into its segments.
fn split_path(path: &[u8]) -> Result<Vec<&[u8]>, FsError> {
    let mut res = Vec::new();
    for segment in path.split(|&ch| ch == b'/') {
        match segment {
            b"" => continue,
            b"." | b".." => return Err(FsError::InvalidPath),
            _ => res.push(segment)
        }
    }
    Ok(res)
}


//============ Testing =======================================================
