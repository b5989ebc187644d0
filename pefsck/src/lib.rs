pub mod chunk;
pub mod data;
pub mod decompressor;
pub mod device;
pub mod dir;
pub mod disk;
pub mod erofs;
mod error;
pub mod extract;
pub mod fragment;
pub mod fsck;
pub mod inode;
pub mod map;
pub mod pipeline;
pub mod superblock;
pub mod workqueue;
mod zmap;

#[cfg(test)]
mod testutil;

pub use error::Error;
