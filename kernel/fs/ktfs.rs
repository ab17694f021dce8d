//! ktfs: 超级块 + 位图 + inode 区 + 数据区的平坦文件系统
//!
//! 磁盘布局见 component::fs::ktfs. 所有块访问都走块缓存;
//! inode 里存的块号是相对数据区起点的

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use component::fs::ktfs::{
    bitmap, block_path, block_pos, blocks_for, max_file_size, read_from, write_to, BlockPath,
    DirEntry, Inode, SuperBlock, BLKSZ, DENSZ, DENTRIES_PER_BLOCK, FILE_IN_USE,
    INDICES_PER_BLOCK, NUM_DIRECT,
};
use logger::info;

use super::cache::Cache;
use crate::io::seek::create_seekable_io;
use crate::io::{Io, IoEndpoint};
use crate::sync::unicore::UPSafeCell;
use crate::{SysError, SysResult};
use sys_interface::syserr;
use sys_interface::sysio::{IOCTL_GETBLKSZ, IOCTL_GETEND, IOCTL_SETEND};

/// 一个已打开文件的登记项
/// revoked 与文件句柄共享: delete 置位后, 存活句柄上的一切 I/O 都被拒绝
struct OpenEntry {
    name: String,
    revoked: Arc<UPSafeCell<bool>>,
}

struct KtfsState {
    root_inode: Inode,
    // 已打开的文件, 重复打开回 EMFILE
    open_files: Vec<OpenEntry>,
}

pub struct Ktfs {
    sb: SuperBlock,
    cache: Cache,
    state: UPSafeCell<KtfsState>,
}

lazy_static! {
    static ref FS: UPSafeCell<Option<Arc<Ktfs>>> = unsafe { UPSafeCell::new(None) };
}

fn fs() -> SysResult<Arc<Ktfs>> {
    FS.exclusive_access()
        .as_ref()
        .cloned()
        .ok_or(SysError(syserr::ENODEV))
}

/// 挂载: 读超级块和根目录 inode, 给后备端点套上块缓存
pub fn fsmount(io: Io) -> SysResult<()> {
    let mut buf = [0u8; BLKSZ];
    if io.readat(0, &mut buf)? != BLKSZ {
        return Err(SysError(syserr::EIO));
    }
    let sb = SuperBlock::from_block(&buf);

    let root_ino = sb.root_directory_inode as usize;
    if io.readat(block_pos(sb.inode_block(root_ino)), &mut buf)? != BLKSZ {
        return Err(SysError(syserr::EIO));
    }
    let root_inode: Inode = read_from(&buf, sb.inode_offset(root_ino));

    let ktfs = Arc::new(Ktfs {
        sb,
        cache: Cache::new(io),
        state: unsafe {
            UPSafeCell::new(KtfsState {
                root_inode,
                open_files: Vec::new(),
            })
        },
    });
    *FS.exclusive_access() = Some(ktfs);

    info!(
        "ktfs mounted: {} blocks, {} bitmap, {} inode blocks, root inode {}, root size {}",
        { sb.block_count },
        { sb.bitmap_block_count },
        { sb.inode_block_count },
        root_ino,
        { root_inode.size }
    );
    Ok(())
}

pub fn fsopen(name: &str) -> SysResult<Io> {
    fs()?.open(name)
}

pub fn fscreate(name: &str) -> SysResult<usize> {
    fs()?.create(name)
}

pub fn fsdelete(name: &str) -> SysResult<usize> {
    fs()?.delete(name)
}

pub fn fsflush() -> SysResult<usize> {
    fs()?.cache.flush()?;
    Ok(0)
}

impl Ktfs {
    /// 数据区相对块号 -> 后备端点上的字节位置
    fn data_pos(&self, rel: u32) -> u64 {
        block_pos(self.sb.data_block(rel))
    }

    fn read_inode(&self, ino: usize) -> SysResult<Inode> {
        let blk = self.cache.get_block(block_pos(self.sb.inode_block(ino)))?;
        let inode = read_from(blk.data(), self.sb.inode_offset(ino));
        self.cache.release_block(blk, false)?;
        Ok(inode)
    }

    fn write_inode(&self, ino: usize, inode: Inode) -> SysResult<()> {
        let mut blk = self.cache.get_block(block_pos(self.sb.inode_block(ino)))?;
        write_to(blk.data_mut(), self.sb.inode_offset(ino), inode);
        self.cache.release_block(blk, true)
    }

    /// 从一个数据区索引块里读出第 slot 个块号
    fn read_index(&self, index_rel: u32, slot: usize) -> SysResult<u32> {
        let blk = self.cache.get_block(self.data_pos(index_rel))?;
        let rel: u32 = read_from(blk.data(), slot * 4);
        self.cache.release_block(blk, false)?;
        Ok(rel)
    }

    fn write_index(&self, index_rel: u32, slot: usize, val: u32) -> SysResult<()> {
        let mut blk = self.cache.get_block(self.data_pos(index_rel))?;
        write_to(blk.data_mut(), slot * 4, val);
        self.cache.release_block(blk, true)
    }

    /// 把文件内块号按直接/间接/双间接翻译成数据区相对块号
    fn file_block(&self, inode: &Inode, file_blk: usize) -> SysResult<u32> {
        match block_path(file_blk).ok_or(SysError(syserr::EINVAL))? {
            BlockPath::Direct(i) => Ok(inode.direct[i]),
            BlockPath::Indirect(slot) => self.read_index(inode.indirect, slot),
            BlockPath::DoubleIndirect {
                dind,
                index_slot,
                leaf_slot,
            } => {
                let index_rel = self.read_index(inode.dindirect[dind], index_slot)?;
                self.read_index(index_rel, leaf_slot)
            }
        }
    }

    fn dentry_count(root: &Inode) -> usize {
        root.size as usize / DENSZ
    }

    fn read_dentry(&self, root: &Inode, i: usize) -> SysResult<DirEntry> {
        let rel = self.file_block(root, i / DENTRIES_PER_BLOCK)?;
        let blk = self.cache.get_block(self.data_pos(rel))?;
        let den = read_from(blk.data(), (i % DENTRIES_PER_BLOCK) * DENSZ);
        self.cache.release_block(blk, false)?;
        Ok(den)
    }

    fn write_dentry(&self, root: &Inode, i: usize, den: DirEntry) -> SysResult<()> {
        let rel = self.file_block(root, i / DENTRIES_PER_BLOCK)?;
        let mut blk = self.cache.get_block(self.data_pos(rel))?;
        write_to(blk.data_mut(), (i % DENTRIES_PER_BLOCK) * DENSZ, den);
        self.cache.release_block(blk, true)
    }

    /// 在位图里找一个空闲块, 置位后返回绝对块号
    fn alloc_block(&self) -> SysResult<u32> {
        let block_count = self.sb.block_count as usize;
        for k in 0..self.sb.bitmap_block_count as usize {
            let mut blk = self.cache.get_block(block_pos(self.sb.bitmap_block(k)))?;
            let found = bitmap::first_clear(blk.data()).filter(|&bit| {
                k * bitmap::BITS_PER_BLOCK + bit < block_count
            });
            match found {
                Some(bit) => {
                    bitmap::set(blk.data_mut(), bit);
                    self.cache.release_block(blk, true)?;
                    return Ok((k * bitmap::BITS_PER_BLOCK + bit) as u32);
                }
                None => self.cache.release_block(blk, false)?,
            }
        }
        Err(SysError(syserr::ENODATABLKS))
    }

    /// 分配一个数据块, 返回数据区相对块号
    fn alloc_data_block(&self) -> SysResult<u32> {
        let abs = self.alloc_block()?;
        assert!(abs >= self.sb.data_base());
        Ok(abs - self.sb.data_base())
    }

    /// 把一个绝对块号在位图里清掉
    fn free_block(&self, abs: u32) -> SysResult<()> {
        if abs < self.sb.data_base() || abs >= self.sb.block_count {
            // 不是数据块, 拒绝
            return Err(SysError(syserr::ENOTSUP));
        }
        let k = abs as usize / bitmap::BITS_PER_BLOCK;
        let bit = abs as usize % bitmap::BITS_PER_BLOCK;
        let mut blk = self.cache.get_block(block_pos(self.sb.bitmap_block(k)))?;
        bitmap::clear(blk.data_mut(), bit);
        self.cache.release_block(blk, true)
    }

    fn free_data_block(&self, rel: u32) -> SysResult<()> {
        self.free_block(self.sb.data_base() + rel)
    }

    /// 打开: 顺序扫根目录项找名字, 命中就包一个带游标的文件端点
    /// 已打开或不存在都回 EMFILE
    fn open(self: &Arc<Self>, name: &str) -> SysResult<Io> {
        if name.is_empty() {
            return Err(SysError(syserr::ENOENT));
        }
        if self
            .state
            .exclusive_access()
            .open_files
            .iter()
            .any(|e| e.name == name)
        {
            return Err(SysError(syserr::EMFILE));
        }

        let root = self.state.exclusive_access().root_inode;
        for i in 0..Self::dentry_count(&root) {
            let den = self.read_dentry(&root, i)?;
            if den.name_matches(name) {
                let inode = self.read_inode(den.inode as usize)?;
                let revoked = Arc::new(unsafe { UPSafeCell::new(false) });
                self.state.exclusive_access().open_files.push(OpenEntry {
                    name: name.to_string(),
                    revoked: Arc::clone(&revoked),
                });
                let file: Io = Arc::new(KtfsFile {
                    fs: Arc::clone(self),
                    dentry: den,
                    size: unsafe { UPSafeCell::new(inode.size) },
                    revoked,
                });
                return create_seekable_io(file);
            }
        }
        Err(SysError(syserr::EMFILE))
    }

    /// 新建长度 0 的文件: 挑一个没被任何目录项占用的 inode 号,
    /// 目录项追加到根目录末尾, 需要的话给根目录添一个数据块
    fn create(&self, name: &str) -> SysResult<usize> {
        if name.is_empty() {
            return Err(SysError(syserr::ENOENT));
        }
        if self
            .state
            .exclusive_access()
            .open_files
            .iter()
            .any(|e| e.name == name)
        {
            return Err(SysError(syserr::EMFILE));
        }

        let mut root = self.state.exclusive_access().root_inode;
        let dentries = Self::dentry_count(&root);
        let root_ino = self.sb.root_directory_inode as usize;

        // 逐个 inode 号查占用
        let mut free_ino = None;
        'outer: for j in 0..self.sb.inode_count() {
            if j == root_ino {
                continue;
            }
            for i in 0..dentries {
                if self.read_dentry(&root, i)?.inode as usize == j {
                    continue 'outer;
                }
            }
            free_ino = Some(j);
            break;
        }
        let free_ino = free_ino.ok_or(SysError(syserr::ENOINODEBLKS))?;

        // 根目录只用直接块, 目录项数量有硬上限
        if dentries >= NUM_DIRECT * DENTRIES_PER_BLOCK {
            return Err(SysError(syserr::EMFILE));
        }
        if dentries % DENTRIES_PER_BLOCK == 0 {
            root.direct[dentries / DENTRIES_PER_BLOCK] = self.alloc_data_block()?;
        }

        root.size += DENSZ as u32;
        self.write_inode(root_ino, root)?;
        self.state.exclusive_access().root_inode = root;

        self.write_dentry(&root, dentries, DirEntry::new(name, free_ino as u16))?;

        let mut inode = Inode::empty();
        inode.flags = FILE_IN_USE;
        self.write_inode(free_ino, inode)?;
        Ok(0)
    }

    /// 删除: 先强制关闭同名的存活句柄, 然后释放文件引用的全部数据块
    /// (含间接与双间接索引块), 目录项与末尾项对调后根目录缩一格
    fn delete(&self, name: &str) -> SysResult<usize> {
        if name.is_empty() {
            return Err(SysError(syserr::ENOENT));
        }
        {
            // 作废标志一置位, 句柄上的后续 I/O 全部被拒,
            // 块归还位图后被重新分配也不会再被旧句柄碰到
            let mut state = self.state.exclusive_access();
            if let Some(pos) = state.open_files.iter().position(|e| e.name == name) {
                let entry = state.open_files.remove(pos);
                *entry.revoked.exclusive_access() = true;
            }
        }

        let mut root = self.state.exclusive_access().root_inode;
        let dentries = Self::dentry_count(&root);
        let root_ino = self.sb.root_directory_inode as usize;

        let mut found = None;
        for i in 0..dentries {
            let den = self.read_dentry(&root, i)?;
            if den.name_matches(name) {
                found = Some((i, den));
                break;
            }
        }
        let (slot, den) = found.ok_or(SysError(syserr::EMFILE))?;

        let inode = self.read_inode(den.inode as usize)?;
        let numblks = blocks_for(inode.size as usize);

        // 数据块逐个归还位图
        for b in 0..numblks {
            let rel = self.file_block(&inode, b)?;
            self.free_data_block(rel)?;
        }
        // 间接索引块本身
        if numblks > NUM_DIRECT {
            self.free_data_block(inode.indirect)?;
        }
        // 双间接块与其中用到的二级索引块
        if numblks > NUM_DIRECT + INDICES_PER_BLOCK {
            let dind_leaves = numblks - (NUM_DIRECT + INDICES_PER_BLOCK);
            let index_blocks = (dind_leaves + INDICES_PER_BLOCK - 1) / INDICES_PER_BLOCK;
            for s in 0..index_blocks {
                let dind = s / INDICES_PER_BLOCK;
                let idx_rel = self.read_index(inode.dindirect[dind], s % INDICES_PER_BLOCK)?;
                self.free_data_block(idx_rel)?;
            }
            for d in 0..=(dind_leaves - 1) / (INDICES_PER_BLOCK * INDICES_PER_BLOCK) {
                self.free_data_block(inode.dindirect[d])?;
            }
        }

        // 末尾目录项顶到被删的位置
        let last = self.read_dentry(&root, dentries - 1)?;
        self.write_dentry(&root, slot, last)?;

        // 末尾项独占一块的话, 这个目录数据块也一并归还
        if (dentries - 1) % DENTRIES_PER_BLOCK == 0 {
            let rel = self.file_block(&root, (dentries - 1) / DENTRIES_PER_BLOCK)?;
            self.free_data_block(rel)?;
        }

        root.size -= DENSZ as u32;
        self.write_inode(root_ino, root)?;
        self.state.exclusive_access().root_inode = root;
        Ok(0)
    }

    /// SETEND: 文件撑大时沿直接/间接/双间接一路补块,
    /// 超出结构上限回 EINVAL, 块分不出来回 ENODATABLKS
    fn set_size(&self, file: &KtfsFile, new_size: u64) -> SysResult<usize> {
        if new_size > max_file_size() {
            return Err(SysError(syserr::EINVAL));
        }

        let ino = file.dentry.inode as usize;
        let mut inode = self.read_inode(ino)?;
        let old_blocks = blocks_for(inode.size as usize);
        let new_blocks = blocks_for(new_size as usize);

        for b in old_blocks..new_blocks {
            match block_path(b).unwrap() {
                BlockPath::Direct(i) => {
                    inode.direct[i] = self.alloc_data_block()?;
                }
                BlockPath::Indirect(slot) => {
                    if slot == 0 {
                        inode.indirect = self.alloc_data_block()?;
                    }
                    let rel = self.alloc_data_block()?;
                    self.write_index(inode.indirect, slot, rel)?;
                }
                BlockPath::DoubleIndirect {
                    dind,
                    index_slot,
                    leaf_slot,
                } => {
                    if index_slot == 0 && leaf_slot == 0 {
                        inode.dindirect[dind] = self.alloc_data_block()?;
                    }
                    if leaf_slot == 0 {
                        let idx = self.alloc_data_block()?;
                        self.write_index(inode.dindirect[dind], index_slot, idx)?;
                    }
                    let index_rel = self.read_index(inode.dindirect[dind], index_slot)?;
                    let rel = self.alloc_data_block()?;
                    self.write_index(index_rel, leaf_slot, rel)?;
                }
            }
        }

        inode.size = new_size as u32;
        self.write_inode(ino, inode)?;
        *file.size.exclusive_access() = new_size as u32;
        Ok(0)
    }
}

/// 一个打开的 ktfs 文件, 外面再包一层 SeekIo 提供 read/write 游标
struct KtfsFile {
    fs: Arc<Ktfs>,
    dentry: DirEntry,
    size: UPSafeCell<u32>,
    // delete 置位后句柄作废, 所有操作回 EMFILE
    revoked: Arc<UPSafeCell<bool>>,
}

impl KtfsFile {
    fn check_revoked(&self) -> SysResult<()> {
        if *self.revoked.exclusive_access() {
            return Err(SysError(syserr::EMFILE));
        }
        Ok(())
    }

    /// 逐块搬运的公共骨架, 读写共用
    fn transfer(&self, pos: u64, len: usize, mut per_block: impl FnMut(&Ktfs, u32, usize, usize) -> SysResult<()>) -> SysResult<usize> {
        let inode = self.fs.read_inode(self.dentry.inode as usize)?;
        let mut off = pos as usize;
        let mut done = 0;
        while done < len {
            let blkno = off / BLKSZ;
            let blkoff = off % BLKSZ;
            let cpycnt = (BLKSZ - blkoff).min(len - done);
            let rel = self.fs.file_block(&inode, blkno)?;
            per_block(&self.fs, rel, blkoff, cpycnt)?;
            off += cpycnt;
            done += cpycnt;
        }
        Ok(len)
    }
}

impl IoEndpoint for KtfsFile {
    /// 读: 截到文件大小, 文件尾返回 0
    fn readat(&self, pos: u64, buf: &mut [u8]) -> SysResult<usize> {
        self.check_revoked()?;
        let size = *self.size.exclusive_access() as u64;
        if pos > size {
            return Err(SysError(syserr::EINVAL));
        }
        let len = buf.len().min((size - pos) as usize);
        if len == 0 {
            return Ok(0);
        }

        let mut copied = 0;
        self.transfer(pos, len, |fs, rel, blkoff, cpycnt| {
            let blk = fs.cache.get_block(fs.data_pos(rel))?;
            buf[copied..copied + cpycnt].copy_from_slice(&blk.data()[blkoff..blkoff + cpycnt]);
            copied += cpycnt;
            fs.cache.release_block(blk, false)
        })
    }

    /// 写: 只覆盖既有字节, 扩容走 SETEND
    fn writeat(&self, pos: u64, buf: &[u8]) -> SysResult<usize> {
        self.check_revoked()?;
        let size = *self.size.exclusive_access() as u64;
        if pos > size {
            return Err(SysError(syserr::EINVAL));
        }
        let len = buf.len().min((size - pos) as usize);
        if len == 0 {
            return Ok(0);
        }

        let mut copied = 0;
        self.transfer(pos, len, |fs, rel, blkoff, cpycnt| {
            let mut blk = fs.cache.get_block(fs.data_pos(rel))?;
            blk.data_mut()[blkoff..blkoff + cpycnt].copy_from_slice(&buf[copied..copied + cpycnt]);
            copied += cpycnt;
            fs.cache.release_block(blk, true)
        })
    }

    fn cntl(&self, cmd: usize, arg: &mut u64) -> SysResult<usize> {
        self.check_revoked()?;
        match cmd {
            IOCTL_GETBLKSZ => Ok(1),
            IOCTL_GETEND => {
                *arg = *self.size.exclusive_access() as u64;
                Ok(0)
            }
            IOCTL_SETEND => self.fs.set_size(self, *arg),
            _ => Err(SysError(syserr::ENOTSUP)),
        }
    }
}

impl Drop for KtfsFile {
    fn drop(&mut self) {
        // 从打开表里摘掉自己, 之后同名文件可以再次打开
        // 按作废标志认领登记项: 文件被删后同名重建并重新打开时,
        // 旧句柄的名字会和新登记项撞上, 不能按名字摘
        let mut state = self.fs.state.exclusive_access();
        if let Some(pos) = state
            .open_files
            .iter()
            .position(|e| Arc::ptr_eq(&e.revoked, &self.revoked))
        {
            state.open_files.remove(pos);
        }
    }
}
