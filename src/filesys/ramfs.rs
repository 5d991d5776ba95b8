//! 内存文件系统
//!
//! 演示与测试用的文件系统协作者: 目录与打开句柄共享同一份内容,
//! 文件被删除后已打开的句柄仍然可用

use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};

use super::{File, FileSystem};

/// 文件内容, 目录与句柄共享
type Contents = Arc<Mutex<Vec<u8>>>;

/// 内存文件系统
pub struct RamFileSystem {
    files: FxHashMap<String, Contents>,
}

impl RamFileSystem {
    pub fn new() -> Self {
        Self {
            files: FxHashMap::default(),
        }
    }
}

impl Default for RamFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for RamFileSystem {
    fn create(&mut self, name: &str, initial_size: u32) -> bool {
        if name.is_empty() || self.files.contains_key(name) {
            return false;
        }
        self.files.insert(
            name.to_string(),
            Arc::new(Mutex::new(vec![0; initial_size as usize])),
        );
        true
    }

    fn remove(&mut self, name: &str) -> bool {
        self.files.remove(name).is_some()
    }

    fn open(&mut self, name: &str) -> Option<Box<dyn File>> {
        let contents = self.files.get(name)?.clone();
        Some(Box::new(RamFile { contents, pos: 0 }))
    }
}

/// 内存文件句柄, 每个句柄独立维护读写位置
struct RamFile {
    contents: Contents,
    pos: u32,
}

impl File for RamFile {
    fn read(&mut self, buf: &mut [u8]) -> u32 {
        let data = self.contents.lock().unwrap();
        let start = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u32;
        n as u32
    }

    fn write(&mut self, buf: &[u8]) -> u32 {
        let mut data = self.contents.lock().unwrap();
        let end = self.pos as usize + buf.len();
        // 写越过文件末尾时扩展文件
        if data.len() < end {
            data.resize(end, 0);
        }
        data[self.pos as usize..end].copy_from_slice(buf);
        self.pos = end as u32;
        buf.len() as u32
    }

    fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    fn tell(&self) -> u32 {
        self.pos
    }

    fn length(&self) -> u32 {
        self.contents.lock().unwrap().len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_open() {
        let mut fs = RamFileSystem::new();
        assert!(fs.create("a.txt", 16));
        let file = fs.open("a.txt").unwrap();
        assert_eq!(file.length(), 16);
    }

    #[test]
    fn create_duplicate_fails() {
        let mut fs = RamFileSystem::new();
        assert!(fs.create("a.txt", 0));
        assert!(!fs.create("a.txt", 0));
    }

    #[test]
    fn open_missing_is_none() {
        let mut fs = RamFileSystem::new();
        assert!(fs.open("nope").is_none());
    }

    #[test]
    fn write_extends_and_reads_back() {
        let mut fs = RamFileSystem::new();
        fs.create("a.txt", 0);
        let mut file = fs.open("a.txt").unwrap();
        assert_eq!(file.write(b"hello"), 5);
        assert_eq!(file.length(), 5);
        assert_eq!(file.tell(), 5);
        file.seek(0);
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn read_past_end_returns_zero() {
        let mut fs = RamFileSystem::new();
        fs.create("a.txt", 4);
        let mut file = fs.open("a.txt").unwrap();
        file.seek(100);
        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf), 0);
    }

    #[test]
    fn removed_file_stays_open() {
        let mut fs = RamFileSystem::new();
        fs.create("a.txt", 0);
        let mut file = fs.open("a.txt").unwrap();
        assert!(fs.remove("a.txt"));
        assert!(!fs.remove("a.txt"));
        assert!(fs.open("a.txt").is_none());
        // 已打开的句柄仍然可写可读
        assert_eq!(file.write(b"xy"), 2);
        file.seek(0);
        let mut buf = [0u8; 2];
        assert_eq!(file.read(&mut buf), 2);
        assert_eq!(&buf, b"xy");
    }
}
