//! File system: directory tree with inline extent lists over a
//! [`DiskView`], backed by the [`Allocator`] for block accounting. A single
//! `data_mutex` serialises every mutation and every full-file read; a
//! separate `counts` mutex guards the handle reference table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::alloc::{Allocator, ExtentToken};
use crate::diskview::DiskView;
use crate::error::{FsError, Result};
use crate::records::{
    DirectoryNode, ExtentEntry, ALLOC_ROOT_BLOCK, MAX_FILE_EXTENTS, MAX_FOLDER_CHILDREN,
    MAX_NAME_LEN, ROOT_BLOCK,
};

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::NameInvalid { name: name.to_string() }.into());
    }
    if name.len() + 1 >= MAX_NAME_LEN {
        return Err(FsError::NameTooLong { name: name.to_string() }.into());
    }
    Ok(())
}

pub struct FileSystem {
    view: DiskView,
    allocator: Allocator,
    data_mutex: Mutex<()>,
    counts: Mutex<HashMap<u64, u32>>,
}

impl FileSystem {
    /// Reads blocks 0 and 1; `formatted` is implicit in whether both carry
    /// the on-disk magic.
    pub fn mount(view: DiskView) -> Arc<Self> {
        let allocator = Allocator::new(view.clone());
        Arc::new(Self { view, allocator, data_mutex: Mutex::new(()), counts: Mutex::new(HashMap::new()) })
    }

    pub fn is_formatted(&self) -> Result<bool> {
        let root: DirectoryNode = self.view.get(ROOT_BLOCK)?;
        let alloc_formatted = self.allocator.is_formatted()?;
        Ok(root.is_formatted() && alloc_formatted)
    }

    /// Destructive; always succeeds. Writes a default root folder and a
    /// default allocator root whose single leaf extent covers
    /// `[RESERVED_BLOCKS, total_sectors)`.
    pub fn format(&self) -> Result<()> {
        let total_sectors = self.view.provider().describe().total_sectors();
        let root = DirectoryNode::new_folder(ROOT_BLOCK);
        self.view.set(ROOT_BLOCK, &root)?;
        self.allocator.format(crate::records::RESERVED_BLOCKS, total_sectors)?;
        debug!(total_sectors, "formatted file system");
        Ok(())
    }

    pub fn root_folder(self: &Arc<Self>) -> FolderHandle {
        self.acquire_folder(ROOT_BLOCK)
    }

    fn acquire_folder(self: &Arc<Self>, addr: u64) -> FolderHandle {
        self.bump(addr);
        FolderHandle { fs: self.clone(), addr }
    }

    fn acquire_file(self: &Arc<Self>, addr: u64) -> FileHandle {
        self.bump(addr);
        FileHandle { fs: self.clone(), addr }
    }

    fn bump(&self, addr: u64) {
        *self.counts.lock().expect("count mutex poisoned").entry(addr).or_insert(0) += 1;
    }

    fn release(&self, addr: u64) {
        let mut counts = self.counts.lock().expect("count mutex poisoned");
        if let Some(n) = counts.get_mut(&addr) {
            *n -= 1;
            if *n == 0 {
                counts.remove(&addr);
            }
        }
    }

    fn instance_count(&self, addr: u64) -> u32 {
        *self.counts.lock().expect("count mutex poisoned").get(&addr).unwrap_or(&0)
    }
}

/// A lifetime-bounded reference to a folder node. Construction (including
/// `Clone`) increments the file system's
/// `instance_count` for this block; `Drop` decrements it.
pub struct FolderHandle {
    fs: Arc<FileSystem>,
    addr: u64,
}

impl Clone for FolderHandle {
    fn clone(&self) -> Self {
        self.fs.bump(self.addr);
        Self { fs: self.fs.clone(), addr: self.addr }
    }
}

impl Drop for FolderHandle {
    fn drop(&mut self) {
        self.fs.release(self.addr);
    }
}

impl FolderHandle {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    fn load(&self) -> Result<DirectoryNode> {
        Ok(self.fs.view.get(self.addr)?)
    }

    /// Scans children for a file (non-folder) entry named `name`.
    pub fn open(&self, name: &str) -> Result<FileHandle> {
        let _g = self.fs.data_mutex.lock().expect("data mutex poisoned");
        let node = self.load()?;
        for child_addr in node.children() {
            let child: DirectoryNode = self.fs.view.get(child_addr)?;
            if !child.is_folder() && child.name() == name {
                return Ok(self.fs.acquire_file(child_addr));
            }
        }
        Err(FsError::NameNotExist { name: name.to_string() }.into())
    }

    /// `"."` returns a copy of self; `".."` returns a handle at
    /// `parent_addr` (or self, at the root); otherwise scans children for a
    /// folder entry named `name`.
    pub fn open_folder(&self, name: &str) -> Result<FolderHandle> {
        if name == "." {
            return Ok(self.clone());
        }
        let _g = self.fs.data_mutex.lock().expect("data mutex poisoned");
        let node = self.load()?;
        if name == ".." {
            let parent = if self.addr == ROOT_BLOCK { ROOT_BLOCK } else { node.parent_addr.get() };
            return Ok(self.fs.acquire_folder(parent));
        }
        for child_addr in node.children() {
            let child: DirectoryNode = self.fs.view.get(child_addr)?;
            if child.is_folder() && child.name() == name {
                return Ok(self.fs.acquire_folder(child_addr));
            }
        }
        Err(FsError::NameNotExist { name: name.to_string() }.into())
    }

    /// Allocates one block, writes the default record, and appends it to
    /// this folder's child list. Returns the new child's block address.
    pub fn create(&self, name: &str, is_folder: bool) -> Result<u64> {
        validate_name(name)?;
        let _g = self.fs.data_mutex.lock().expect("data mutex poisoned");
        let mut node = self.load()?;
        let mut children = node.children();
        if children.len() >= MAX_FOLDER_CHILDREN {
            return Err(FsError::CapacityExceeded.into());
        }
        for &child_addr in &children {
            let child: DirectoryNode = self.fs.view.get(child_addr)?;
            if child.name() == name {
                return Err(FsError::NameAlreadyExist { name: name.to_string() }.into());
            }
        }

        let addr = self.fs.allocator.new_block()?;
        let mut new_node = if is_folder { DirectoryNode::new_folder(self.addr) } else { DirectoryNode::new_file(self.addr) };
        new_node.set_name(name);
        self.fs.view.set(addr, &new_node)?;

        children.push(addr);
        node.set_children(&children);
        self.fs.view.set(self.addr, &node)?;
        Ok(addr)
    }

    /// Looks up the child named `name` whose `is_folder` bit matches (a file
    /// and a folder may share a name slot in the wire protocol's separate
    /// `RM`/`RMDIR` instructions, so the type is part of the lookup key, not
    /// just a post-hoc assertion). Fails `NotEmpty` for a non-empty folder
    /// unless `recursive` is set — the protocol's RMDIR never requests
    /// recursive removal, but the API supports it for programmatic callers.
    ///
    /// The child-name lookup and busy check run under `data_mutex`, but the
    /// lock is dropped before any recursive descent: `data_mutex` is a
    /// plain, non-reentrant `std::sync::Mutex`, and a recursive call lands
    /// back on this same mutex through `acquire_folder`/`remove`. Holding
    /// the outer guard across that call would deadlock the thread against
    /// itself.
    pub fn remove(&self, name: &str, is_folder: bool, recursive: bool) -> Result<()> {
        let child_addr = {
            let _g = self.fs.data_mutex.lock().expect("data mutex poisoned");
            let node = self.load()?;
            let children = node.children();
            let Some(idx) = children.iter().position(|&addr| {
                self.fs
                    .view
                    .get::<DirectoryNode>(addr)
                    .map(|c| c.is_folder() == is_folder && c.name() == name)
                    .unwrap_or(false)
            }) else {
                return Err(FsError::NameNotExist { name: name.to_string() }.into());
            };
            let child_addr = children[idx];
            if self.fs.instance_count(child_addr) > 0 {
                return Err(FsError::BusyHandle { addr: child_addr, count: self.fs.instance_count(child_addr) }.into());
            }
            if is_folder {
                let child: DirectoryNode = self.fs.view.get(child_addr)?;
                if !child.children().is_empty() && !recursive {
                    return Err(FsError::NotEmpty { name: name.to_string() }.into());
                }
            }
            child_addr
        };

        let child: DirectoryNode = self.fs.view.get(child_addr)?;
        if child.is_folder() {
            if recursive {
                let sub = self.fs.acquire_folder(child_addr);
                for gc_addr in child.children() {
                    let gc: DirectoryNode = self.fs.view.get(gc_addr)?;
                    sub.remove(&gc.name(), gc.is_folder(), true)?;
                }
            }
        } else {
            for extent in child.extents() {
                self.fs.allocator.delete_extent(ExtentToken { addr: extent.disk_addr.get(), len: extent.len.get() as u64 })?;
            }
        }

        let _g = self.fs.data_mutex.lock().expect("data mutex poisoned");
        self.fs.allocator.delete_block(child_addr)?;
        let mut node = self.load()?;
        let mut children = node.children();
        children.retain(|&addr| addr != child_addr);
        node.set_children(&children);
        self.fs.view.set(self.addr, &node)?;
        Ok(())
    }

    /// Each child's name, suffixed with `/` if it is a folder.
    pub fn list(&self) -> Result<Vec<String>> {
        let _g = self.fs.data_mutex.lock().expect("data mutex poisoned");
        let node = self.load()?;
        let mut out = Vec::with_capacity(node.entry_count() as usize);
        for child_addr in node.children() {
            let child: DirectoryNode = self.fs.view.get(child_addr)?;
            let mut name = child.name();
            if child.is_folder() {
                name.push('/');
            }
            out.push(name);
        }
        Ok(out)
    }
}

/// A lifetime-bounded reference to a file node, with the same handle
/// semantics as [`FolderHandle`].
pub struct FileHandle {
    fs: Arc<FileSystem>,
    addr: u64,
}

impl Clone for FileHandle {
    fn clone(&self) -> Self {
        self.fs.bump(self.addr);
        Self { fs: self.fs.clone(), addr: self.addr }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.fs.release(self.addr);
    }
}

/// Flattens a file's extent list into one disk address per file block, in
/// `file_block_no` order. Extents are appended in order by `write_all`, so
/// no sort is needed.
fn flatten_extents(extents: &[ExtentEntry]) -> Vec<u64> {
    let mut out = Vec::new();
    for e in extents {
        for k in 0..e.len.get() as u64 {
            out.push(e.disk_addr.get() + k);
        }
    }
    out
}

fn append_block(extents: &mut Vec<ExtentEntry>, disk_addr: u64, file_block_no: u32) -> Result<()> {
    if let Some(last) = extents.last_mut() {
        if last.disk_addr.get() + last.len.get() as u64 == disk_addr && last.file_block_no.get() + last.len.get() == file_block_no {
            last.len = (last.len.get() + 1).into();
            return Ok(());
        }
    }
    if extents.len() >= MAX_FILE_EXTENTS {
        return Err(FsError::CapacityExceeded.into());
    }
    extents.push(ExtentEntry { disk_addr: disk_addr.into(), file_block_no: file_block_no.into(), len: 1.into() });
    Ok(())
}

/// Drops trailing file blocks beyond `new_blocks`, returning the freed disk
/// blocks to the allocator.
fn shrink_extents(extents: &mut Vec<ExtentEntry>, new_blocks: u64, allocator: &Allocator) -> Result<()> {
    let mut kept = Vec::new();
    for e in extents.iter() {
        let start = e.file_block_no.get() as u64;
        let len = e.len.get() as u64;
        let end = start + len;
        if end <= new_blocks {
            kept.push(*e);
        } else if start >= new_blocks {
            allocator.delete_extent(ExtentToken { addr: e.disk_addr.get(), len })?;
        } else {
            let keep_len = new_blocks - start;
            let free_len = len - keep_len;
            let free_addr = e.disk_addr.get() + keep_len;
            allocator.delete_extent(ExtentToken { addr: free_addr, len: free_len })?;
            kept.push(ExtentEntry { disk_addr: e.disk_addr, file_block_no: e.file_block_no, len: (keep_len as u32).into() });
        }
    }
    *extents = kept;
    Ok(())
}

impl FileHandle {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    fn load(&self) -> Result<DirectoryNode> {
        Ok(self.fs.view.get(self.addr)?)
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        let _g = self.fs.data_mutex.lock().expect("data mutex poisoned");
        let node = self.load()?;
        let size_blocks = node.size_blocks.get() as u64;
        if size_blocks == 0 {
            return Ok(Vec::new());
        }
        let size_offset = node.size_offset.get() as usize;
        let disk_blocks = flatten_extents(&node.extents());
        let mut buf = Vec::with_capacity(node.total_bytes() as usize);
        for (i, &addr) in disk_blocks.iter().enumerate() {
            if i as u64 == size_blocks - 1 {
                buf.extend(self.fs.view.read_partial(addr, size_offset)?);
            } else {
                buf.extend(self.fs.view.read_partial(addr, crate::records::SECTOR_SIZE)?);
            }
        }
        Ok(buf)
    }

    pub fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let _g = self.fs.data_mutex.lock().expect("data mutex poisoned");
        let mut node = self.load()?;
        let current_blocks = node.size_blocks.get() as u64;
        let len = bytes.len() as u64;
        let new_blocks = if len == 0 { 0 } else { (len + 255) / 256 };
        let new_offset = if len == 0 { 0 } else { ((len - 1) % 256) + 1 };

        let mut extents = node.extents();
        if new_blocks > current_blocks {
            for i in current_blocks..new_blocks {
                let addr = self.fs.allocator.new_block()?;
                append_block(&mut extents, addr, i as u32)?;
            }
        } else if new_blocks < current_blocks {
            shrink_extents(&mut extents, new_blocks, &self.fs.allocator)?;
        }

        node.set_extents(&extents);
        node.size_blocks = (new_blocks as u32).into();
        node.size_offset = (new_offset as u32).into();
        self.fs.view.set(self.addr, &node)?;

        let disk_blocks = flatten_extents(&extents);
        for i in 0..new_blocks {
            let addr = disk_blocks[i as usize];
            let start = (i * 256) as usize;
            if i == new_blocks - 1 {
                self.fs.view.write_partial(addr, &bytes[start..])?;
            } else {
                self.fs.view.write_partial(addr, &bytes[start..start + 256])?;
            }
        }
        Ok(())
    }

    /// Read-splice-write at `pos`; O(filesize) by design.
    pub fn insert(&self, pos: u64, data: &[u8]) -> Result<()> {
        let mut content = self.read_all()?;
        let pos = (pos as usize).min(content.len());
        content.splice(pos..pos, data.iter().copied());
        self.write_all(&content)
    }

    pub fn erase(&self, pos: u64, len: u64) -> Result<()> {
        let mut content = self.read_all()?;
        let pos = (pos as usize).min(content.len());
        let end = (pos + len as usize).min(content.len());
        content.splice(pos..end, std::iter::empty());
        self.write_all(&content)
    }
}

const _: () = assert!(ALLOC_ROOT_BLOCK == 1 && ROOT_BLOCK == 0);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ram::RamStore;
    use crate::storage::DiskDescription;

    fn fresh_fs(total_sectors: u64) -> Arc<FileSystem> {
        let desc = DiskDescription { cylinders: 1, sectors_per_cylinder: total_sectors, bytes_per_sector: 256 };
        let view = DiskView::new(Arc::new(RamStore::new(desc)));
        let fs = FileSystem::mount(view);
        fs.format().unwrap();
        fs
    }

    #[test]
    fn format_then_empty_root() {
        let fs = fresh_fs(200);
        let root = fs.root_folder();
        assert!(root.list().unwrap().is_empty());
        assert_eq!(fs.allocator.free_blocks().unwrap(), 198);
    }

    #[test]
    fn create_and_list_folder_and_file() {
        let fs = fresh_fs(200);
        let root = fs.root_folder();
        root.create("docs", true).unwrap();
        root.create("readme", false).unwrap();
        let mut names = root.list().unwrap();
        names.sort();
        assert_eq!(names, vec!["docs/".to_string(), "readme".to_string()]);
    }

    #[test]
    fn duplicate_name_rejected() {
        let fs = fresh_fs(200);
        let root = fs.root_folder();
        root.create("a", false).unwrap();
        assert!(matches!(root.create("a", true), Err(crate::error::VdfsError::Fs(FsError::NameAlreadyExist { .. }))));
    }

    #[test]
    fn invalid_names_rejected() {
        let fs = fresh_fs(200);
        let root = fs.root_folder();
        assert!(matches!(root.create("", false), Err(crate::error::VdfsError::Fs(FsError::NameInvalid { .. }))));
        assert!(matches!(root.create(".", false), Err(crate::error::VdfsError::Fs(FsError::NameInvalid { .. }))));
        assert!(matches!(root.create("a/b", false), Err(crate::error::VdfsError::Fs(FsError::NameInvalid { .. }))));
        let long = "x".repeat(70);
        assert!(matches!(root.create(&long, false), Err(crate::error::VdfsError::Fs(FsError::NameTooLong { .. }))));
    }

    #[test]
    fn write_then_read_roundtrip() {
        let fs = fresh_fs(200);
        let root = fs.root_folder();
        root.create("f", false).unwrap();
        let f = root.open("f").unwrap();
        let payload = vec![b'A'; 300];
        f.write_all(&payload).unwrap();
        let node = f.load().unwrap();
        assert_eq!(node.size_blocks.get(), 2);
        assert_eq!(node.size_offset.get(), 44);
        assert_eq!(f.read_all().unwrap(), payload);
    }

    #[test]
    fn shrink_returns_blocks() {
        let fs = fresh_fs(200);
        let root = fs.root_folder();
        root.create("f", false).unwrap();
        let f = root.open("f").unwrap();
        f.write_all(&vec![1u8; 1000]).unwrap();
        let before = fs.allocator.free_blocks().unwrap();
        f.write_all(&vec![1u8; 10]).unwrap();
        let after = fs.allocator.free_blocks().unwrap();
        assert!(after > before);
        assert_eq!(f.read_all().unwrap(), vec![1u8; 10]);
    }

    #[test]
    fn busy_handle_blocks_removal() {
        let fs = fresh_fs(200);
        let root = fs.root_folder();
        root.create("d", true).unwrap();
        let handle = root.open_folder("d").unwrap();
        assert!(matches!(root.remove("d", true, false), Err(crate::error::VdfsError::Fs(FsError::BusyHandle { .. }))));
        drop(handle);
        root.remove("d", true, false).unwrap();
    }

    #[test]
    fn non_empty_folder_requires_recursive() {
        let fs = fresh_fs(200);
        let root = fs.root_folder();
        root.create("d", true).unwrap();
        let d = root.open_folder("d").unwrap();
        d.create("inner", false).unwrap();
        drop(d);
        assert!(matches!(root.remove("d", true, false), Err(crate::error::VdfsError::Fs(FsError::NotEmpty { .. }))));
        root.remove("d", true, true).unwrap();
        assert!(root.open_folder("d").is_err());
    }

    #[test]
    fn remove_type_mismatch_is_not_found() {
        let fs = fresh_fs(200);
        let root = fs.root_folder();
        root.create("d", true).unwrap();
        root.create("f", false).unwrap();
        assert!(matches!(root.remove("d", false, false), Err(crate::error::VdfsError::Fs(FsError::NameNotExist { .. }))));
        assert!(matches!(root.remove("f", true, false), Err(crate::error::VdfsError::Fs(FsError::NameNotExist { .. }))));
        root.remove("d", true, false).unwrap();
        root.remove("f", false, false).unwrap();
    }

    #[test]
    fn dot_and_dotdot_navigation() {
        let fs = fresh_fs(200);
        let root = fs.root_folder();
        root.create("d", true).unwrap();
        let d = root.open_folder("d").unwrap();
        let same = d.open_folder(".").unwrap();
        assert_eq!(same.addr(), d.addr());
        let back = d.open_folder("..").unwrap();
        assert_eq!(back.addr(), root.addr());
        let root_dotdot = root.open_folder("..").unwrap();
        assert_eq!(root_dotdot.addr(), root.addr());
    }

    #[test]
    fn insert_and_erase() {
        let fs = fresh_fs(200);
        let root = fs.root_folder();
        root.create("f", false).unwrap();
        let f = root.open("f").unwrap();
        f.write_all(b"helloworld").unwrap();
        f.insert(5, b" ").unwrap();
        assert_eq!(f.read_all().unwrap(), b"hello world");
        f.erase(5, 1).unwrap();
        assert_eq!(f.read_all().unwrap(), b"helloworld");
    }
}
