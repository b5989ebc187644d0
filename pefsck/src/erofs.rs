use std::mem::size_of;

use log::debug;
use zerocopy::FromBytes;

use crate::decompressor::{BuiltinDecompressor, Decompressor};
use crate::device::Device;
use crate::disk::{DeviceSlot, Superblock, EROFS_SUPER_OFFSET, INODE_SLOT_BITS};
use crate::superblock::{self, SuperblockInfo};
use crate::Error;

#[derive(Debug, Clone, Copy)]
struct DeviceRange {
    blocks: u32,
    mapped_blkaddr: u32,
}

/// An opened image: the primary device, any extra blob devices, the parsed superblock and the
/// codec used for compressed extents. Shared read-only between walker threads.
pub struct Erofs {
    dev: Box<dyn Device>,
    extra: Vec<Box<dyn Device>>,
    pub sb: SuperblockInfo,
    slots: Vec<DeviceRange>,
    device_id_mask: u16,
    pub(crate) codec: Box<dyn Decompressor>,
}

impl Erofs {
    pub fn open(dev: Box<dyn Device>) -> Result<Erofs, Error> {
        let mut head = vec![0u8; EROFS_SUPER_OFFSET + size_of::<Superblock>()];
        dev.read_at(0, &mut head)?;
        let sb = SuperblockInfo::parse(&head)?;

        let mut slots = Vec::with_capacity(sb.extra_devices.into());
        let table = u64::from(sb.devt_slotoff) * size_of::<DeviceSlot>() as u64;
        for i in 0..u64::from(sb.extra_devices) {
            let mut raw = [0u8; size_of::<DeviceSlot>()];
            dev.read_at(table + i * size_of::<DeviceSlot>() as u64, &mut raw)?;
            let slot = DeviceSlot::read_from_bytes(&raw[..])
                .map_err(|_| Error::StructuralCorruption("device slot"))?;
            slots.push(DeviceRange {
                blocks: slot.blocks.get(),
                mapped_blkaddr: slot.mapped_blkaddr.get(),
            });
        }
        let device_id_mask = ((u32::from(sb.extra_devices) + 1).next_power_of_two() - 1) as u16;
        debug!(
            "opened image: block size {}, {} extra devices",
            sb.block_size(),
            slots.len()
        );

        Ok(Erofs {
            dev,
            extra: vec![],
            sb,
            slots,
            device_id_mask,
            codec: Box::new(BuiltinDecompressor),
        })
    }

    /// Attach extra blob devices, in device table order.
    pub fn with_devices(mut self, devices: Vec<Box<dyn Device>>) -> Result<Erofs, Error> {
        if devices.len() > self.slots.len() {
            return Err(Error::InvalidInput(
                "more devices given than the device table describes",
            ));
        }
        self.extra = devices;
        Ok(self)
    }

    pub fn with_decompressor(mut self, codec: Box<dyn Decompressor>) -> Erofs {
        self.codec = codec;
        self
    }

    pub fn block_size(&self) -> u64 {
        self.sb.block_size()
    }

    pub fn blkoff(&self, addr: u64) -> u64 {
        addr & (self.block_size() - 1)
    }

    pub fn blk_round_up(&self, len: u64) -> u64 {
        len.div_ceil(self.block_size())
    }

    /// Byte position of the inode record for `nid`.
    pub fn iloc(&self, nid: u64) -> Result<u64, Error> {
        let base = u64::from(self.sb.meta_blkaddr) << self.sb.blkszbits;
        nid.checked_mul(1 << INODE_SLOT_BITS)
            .and_then(|x| x.checked_add(base))
            .ok_or(Error::StructuralCorruption("nid out of range"))
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.dev.read_at(offset, buf)
    }

    pub fn read_dev(&self, device: u16, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        if device == 0 {
            return self.dev.read_at(offset, buf);
        }
        self.extra
            .get(usize::from(device) - 1)
            .ok_or(Error::InvalidInput("missing extra device"))?
            .read_at(offset, buf)
    }

    /// Resolve a (device id, byte address) pair to the device that actually holds the bytes.
    /// Device 0 addresses that fall inside a device slot's mapped range are redirected there.
    pub fn map_device(&self, device: u16, pa: u64) -> Result<(u16, u64), Error> {
        if device != 0 {
            if device > self.sb.extra_devices {
                return Err(Error::InvalidInput("device id beyond the device table"));
            }
            return Ok((device, pa));
        }
        let bits = self.sb.blkszbits;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.mapped_blkaddr == 0 {
                continue;
            }
            let start = u64::from(slot.mapped_blkaddr) << bits;
            let len = u64::from(slot.blocks) << bits;
            if pa >= start && pa - start < len {
                return Ok(((i + 1) as u16, pa - start));
            }
        }
        Ok((0, pa))
    }

    pub fn mask_device_id(&self, device: u16) -> u16 {
        device & self.device_id_mask
    }

    /// Check the superblock checksum if the image says it has one.
    pub fn verify_checksum(&self) -> Result<(), Error> {
        if !self.sb.has_checksum() {
            return Ok(());
        }
        let mut raw = vec![0u8; superblock::checksum_end(self.sb.blkszbits)];
        self.dev.read_at(0, &mut raw)?;
        superblock::verify(&raw)
    }
}
