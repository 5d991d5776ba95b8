//! 用户内存管理模块
//!
//! 每个进程一份稀疏页表: 只有映射过的页真正占用宿主内存

use nohash_hasher::IntMap;
use thiserror::Error;

use crate::config::{PAGE_SIZE, PHYS_BASE};

/// 用户内存错误类型
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("访问未映射页: 地址 {addr:#x}")]
    Unmapped { addr: u32 },
    #[error("访问内核地址空间: 地址 {addr:#x}")]
    KernelSpace { addr: u32 },
    #[error("地址范围回绕: 地址 {addr:#x}, 大小 {size}")]
    Overflow { addr: u32, size: u32 },
}

/// 单个用户页
type Page = Box<[u8; PAGE_SIZE as usize]>;

/// 进程的用户地址空间
pub struct UserMemory {
    /// 页号到页数据的映射
    pages: IntMap<u32, Page>,
}

impl UserMemory {
    /// 创建空地址空间
    pub fn new() -> Self {
        Self {
            pages: IntMap::default(),
        }
    }

    /// 创建地址空间并在 PHYS_BASE 下方映射 stack_pages 页用户栈
    pub fn with_stack(stack_pages: u32) -> Self {
        let mut mem = Self::new();
        for i in 1..=stack_pages {
            mem.map_page(PHYS_BASE - i * PAGE_SIZE);
        }
        mem
    }

    /// 映射包含 vaddr 的页, 已映射时为空操作
    pub fn map_page(&mut self, vaddr: u32) {
        self.pages
            .entry(vaddr / PAGE_SIZE)
            .or_insert_with(|| Box::new([0; PAGE_SIZE as usize]));
    }

    /// 页表成员查询: 地址当前是否映射在本地址空间
    pub fn is_mapped(&self, vaddr: u32) -> bool {
        vaddr < PHYS_BASE && self.pages.contains_key(&(vaddr / PAGE_SIZE))
    }

    fn page_at(&self, addr: u32) -> Result<(&Page, usize), MemoryError> {
        if addr >= PHYS_BASE {
            return Err(MemoryError::KernelSpace { addr });
        }
        let page = self
            .pages
            .get(&(addr / PAGE_SIZE))
            .ok_or(MemoryError::Unmapped { addr })?;
        Ok((page, (addr % PAGE_SIZE) as usize))
    }

    fn page_at_mut(&mut self, addr: u32) -> Result<(&mut Page, usize), MemoryError> {
        if addr >= PHYS_BASE {
            return Err(MemoryError::KernelSpace { addr });
        }
        let page = self
            .pages
            .get_mut(&(addr / PAGE_SIZE))
            .ok_or(MemoryError::Unmapped { addr })?;
        Ok((page, (addr % PAGE_SIZE) as usize))
    }

    /// 读取一个字节
    pub fn read_byte(&self, addr: u32) -> Result<u8, MemoryError> {
        let (page, off) = self.page_at(addr)?;
        Ok(page[off])
    }

    /// 写入一个字节
    pub fn write_byte(&mut self, addr: u32, value: u8) -> Result<(), MemoryError> {
        let (page, off) = self.page_at_mut(addr)?;
        page[off] = value;
        Ok(())
    }

    /// 读取一段内存, 按页分块拷贝
    pub fn read_bytes(&self, addr: u32, len: u32) -> Result<Vec<u8>, MemoryError> {
        let end = addr
            .checked_add(len)
            .ok_or(MemoryError::Overflow { addr, size: len })?;
        let mut out = Vec::with_capacity(len as usize);
        let mut cur = addr;
        while cur < end {
            let (page, off) = self.page_at(cur)?;
            let take = ((PAGE_SIZE as usize - off) as u32).min(end - cur) as usize;
            out.extend_from_slice(&page[off..off + take]);
            cur += take as u32;
        }
        Ok(out)
    }

    /// 写入一段内存, 按页分块拷贝
    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let len = data.len() as u32;
        let end = addr
            .checked_add(len)
            .ok_or(MemoryError::Overflow { addr, size: len })?;
        let mut cur = addr;
        while cur < end {
            let (page, off) = self.page_at_mut(cur)?;
            let take = ((PAGE_SIZE as usize - off) as u32).min(end - cur) as usize;
            let start = (cur - addr) as usize;
            page[off..off + take].copy_from_slice(&data[start..start + take]);
            cur += take as u32;
        }
        Ok(())
    }

    /// 读取一个小端 32 位字
    pub fn read_word(&self, addr: u32) -> Result<u32, MemoryError> {
        let bytes = self.read_bytes(addr, 4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// 写入一个小端 32 位字
    pub fn write_word(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write_bytes(addr, &value.to_le_bytes())
    }
}

impl Default for UserMemory {
    fn default() -> Self {
        Self::new()
    }
}
