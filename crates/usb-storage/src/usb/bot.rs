//! USB Mass Storage Bulk-Only Transport (BOT) with the SCSI transparent command set.
//!
//! Every command is a three-phase exchange on the bulk endpoints:
//! a 31-byte Command Block Wrapper (CBW) out, an optional data phase, and a
//! 13-byte Command Status Wrapper (CSW) in. Only the read-side commands are
//! implemented since the filesystem is mounted read-only.

use crate::block::BlockDevice;
use log::{debug, info, warn};
use std::io;

const CBW_SIGNATURE: u32 = 0x4342_5355;
const CSW_SIGNATURE: u32 = 0x5342_5355;
const CBW_LEN: usize = 31;
const CSW_LEN: usize = 13;
const CBW_FLAG_DATA_IN: u8 = 0x80;

const SCSI_TEST_UNIT_READY: u8 = 0x00;
const SCSI_REQUEST_SENSE: u8 = 0x03;
const SCSI_INQUIRY: u8 = 0x12;
const SCSI_READ_CAPACITY_10: u8 = 0x25;
const SCSI_READ_10: u8 = 0x28;

const INQUIRY_LEN: usize = 36;
const REQUEST_SENSE_LEN: usize = 18;
const READ_CAPACITY_LEN: usize = 8;

/// Largest data phase we request in one READ(10).
const MAX_TRANSFER_BYTES: usize = 64 * 1024;

/// Bulk endpoint pair of a claimed mass-storage interface.
pub trait BulkPipe: Send {
    /// Sends `data` on the bulk OUT endpoint.
    fn bulk_out(&mut self, data: &[u8]) -> io::Result<()>;

    /// Receives up to `buf.len()` bytes on the bulk IN endpoint.
    /// Returns fewer bytes when the device ends the transfer with a short packet.
    fn bulk_in(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Releases the interface.
    fn release(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Status byte of a CSW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Passed,
    Failed,
    PhaseError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatusWrapper {
    pub tag: u32,
    pub residue: u32,
    pub status: CommandStatus,
}

/// Encodes a Command Block Wrapper.
pub fn encode_cbw(tag: u32, transfer_len: u32, data_in: bool, lun: u8, cdb: &[u8]) -> [u8; CBW_LEN] {
    debug_assert!(!cdb.is_empty() && cdb.len() <= 16, "CDB must be 1..=16 bytes");
    let mut cbw = [0u8; CBW_LEN];
    cbw[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
    cbw[4..8].copy_from_slice(&tag.to_le_bytes());
    cbw[8..12].copy_from_slice(&transfer_len.to_le_bytes());
    cbw[12] = if data_in { CBW_FLAG_DATA_IN } else { 0 };
    cbw[13] = lun & 0x0F;
    cbw[14] = cdb.len() as u8;
    cbw[15..15 + cdb.len()].copy_from_slice(cdb);
    cbw
}

/// Decodes and validates a Command Status Wrapper.
pub fn decode_csw(bytes: &[u8]) -> io::Result<CommandStatusWrapper> {
    if bytes.len() != CSW_LEN {
        return Err(protocol_error(format!("CSW is {} bytes, expected {}", bytes.len(), CSW_LEN)));
    }
    let signature = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if signature != CSW_SIGNATURE {
        return Err(protocol_error(format!("bad CSW signature {:#010x}", signature)));
    }
    let status = match bytes[12] {
        0 => CommandStatus::Passed,
        1 => CommandStatus::Failed,
        2 => CommandStatus::PhaseError,
        other => return Err(protocol_error(format!("unknown CSW status {}", other))),
    };
    Ok(CommandStatusWrapper {
        tag: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        residue: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        status,
    })
}

fn protocol_error(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Result of an INQUIRY, for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InquiryData {
    pub peripheral_device_type: u8,
    pub removable: bool,
    pub vendor: String,
    pub product: String,
}

impl InquiryData {
    fn parse(bytes: &[u8]) -> Self {
        let text = |range: std::ops::Range<usize>| {
            bytes
                .get(range)
                .map(|b| String::from_utf8_lossy(b).trim().to_string())
                .unwrap_or_default()
        };
        Self {
            peripheral_device_type: bytes.first().map(|b| b & 0x1F).unwrap_or(0x1F),
            removable: bytes.get(1).is_some_and(|b| b & 0x80 != 0),
            vendor: text(8..16),
            product: text(16..32),
        }
    }
}

/// A SCSI block device reached through Bulk-Only Transport.
pub struct BotBlockDevice<P: BulkPipe> {
    pipe: P,
    lun: u8,
    next_tag: u32,
    block_size: u32,
    block_count: u64,
    closed: bool,
}

impl<P: BulkPipe> BotBlockDevice<P> {
    /// Initializes LUN 0: INQUIRY, TEST UNIT READY, READ CAPACITY(10).
    pub fn init(pipe: P) -> io::Result<Self> {
        let mut device = Self {
            pipe,
            lun: 0,
            next_tag: 1,
            block_size: 0,
            block_count: 0,
            closed: false,
        };

        let inquiry = device.inquiry()?;
        info!(
            "SCSI device: vendor='{}', product='{}', type={:#04x}, removable={}",
            inquiry.vendor, inquiry.product, inquiry.peripheral_device_type, inquiry.removable
        );
        if inquiry.peripheral_device_type != 0 {
            warn!(
                "Peripheral type {:#04x} is not a direct-access block device, continuing anyway",
                inquiry.peripheral_device_type
            );
        }

        if !device.test_unit_ready()? {
            // A unit attention after insertion is normal; reading sense clears it
            let sense = device.request_sense()?;
            debug!("TEST UNIT READY failed, sense key {:#04x}", sense);
        }

        let (last_lba, block_size) = device.read_capacity()?;
        if block_size == 0 {
            return Err(protocol_error("device reports a zero block size".to_string()));
        }
        device.block_size = block_size;
        device.block_count = u64::from(last_lba) + 1;
        info!(
            "SCSI capacity: {} blocks of {} bytes ({} MiB)",
            device.block_count,
            block_size,
            device.block_count * u64::from(block_size) / (1024 * 1024)
        );
        Ok(device)
    }

    fn inquiry(&mut self) -> io::Result<InquiryData> {
        let mut data = [0u8; INQUIRY_LEN];
        let cdb = [SCSI_INQUIRY, 0, 0, 0, INQUIRY_LEN as u8, 0];
        let received = self.command(&cdb, &mut data)?.0;
        Ok(InquiryData::parse(&data[..received]))
    }

    /// Returns false when the device reports a check condition.
    fn test_unit_ready(&mut self) -> io::Result<bool> {
        let cdb = [SCSI_TEST_UNIT_READY, 0, 0, 0, 0, 0];
        let (_, status) = self.command(&cdb, &mut [])?;
        Ok(status == CommandStatus::Passed)
    }

    /// Returns the sense key.
    fn request_sense(&mut self) -> io::Result<u8> {
        let mut data = [0u8; REQUEST_SENSE_LEN];
        let cdb = [SCSI_REQUEST_SENSE, 0, 0, 0, REQUEST_SENSE_LEN as u8, 0];
        self.command(&cdb, &mut data)?;
        Ok(data[2] & 0x0F)
    }

    fn read_capacity(&mut self) -> io::Result<(u32, u32)> {
        let mut data = [0u8; READ_CAPACITY_LEN];
        let cdb = [SCSI_READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let (received, status) = self.command(&cdb, &mut data)?;
        if status != CommandStatus::Passed || received != READ_CAPACITY_LEN {
            return Err(protocol_error("READ CAPACITY failed".to_string()));
        }
        let last_lba = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let block_size = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        Ok((last_lba, block_size))
    }

    fn read_10(&mut self, lba: u32, blocks: u16, buf: &mut [u8]) -> io::Result<()> {
        let lba_bytes = lba.to_be_bytes();
        let len_bytes = blocks.to_be_bytes();
        let cdb = [
            SCSI_READ_10,
            0,
            lba_bytes[0],
            lba_bytes[1],
            lba_bytes[2],
            lba_bytes[3],
            0,
            len_bytes[0],
            len_bytes[1],
            0,
        ];
        let (received, status) = self.command(&cdb, buf)?;
        if status != CommandStatus::Passed {
            return Err(io::Error::other(format!("READ(10) at LBA {} failed", lba)));
        }
        if received != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("READ(10) at LBA {} returned {} of {} bytes", lba, received, buf.len()),
            ));
        }
        Ok(())
    }

    /// Runs one CBW/data/CSW exchange. Data flows device-to-host when `data` is non-empty.
    ///
    /// Returns the number of data bytes received and the command status. A phase
    /// error is reported as an I/O error since the transport needs a reset to recover.
    fn command(&mut self, cdb: &[u8], data: &mut [u8]) -> io::Result<(usize, CommandStatus)> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device is closed"));
        }
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);

        let cbw = encode_cbw(tag, data.len() as u32, !data.is_empty(), self.lun, cdb);
        self.pipe.bulk_out(&cbw)?;

        let mut received = 0;
        while received < data.len() {
            let wanted = data.len() - received;
            let count = self.pipe.bulk_in(&mut data[received..])?;
            received += count;
            if count < wanted {
                break;
            }
        }

        let mut csw_bytes = [0u8; CSW_LEN];
        let count = self.pipe.bulk_in(&mut csw_bytes)?;
        let csw = decode_csw(&csw_bytes[..count])?;
        if csw.tag != tag {
            return Err(protocol_error(format!("CSW tag {} does not match CBW tag {}", csw.tag, tag)));
        }
        if csw.status == CommandStatus::PhaseError {
            return Err(protocol_error(format!("phase error on SCSI opcode {:#04x}", cdb[0])));
        }
        Ok((received, csw.status))
    }
}

impl<P: BulkPipe> BlockDevice for BotBlockDevice<P> {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        let block_size = self.block_size as usize;
        if buf.len() % block_size != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read length is not a multiple of the block size",
            ));
        }
        let total_blocks = (buf.len() / block_size) as u64;
        if lba + total_blocks > self.block_count {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past the end of the device"));
        }

        let max_blocks = (MAX_TRANSFER_BYTES / block_size).clamp(1, usize::from(u16::MAX));
        let mut current = lba;
        for chunk in buf.chunks_mut(max_blocks * block_size) {
            let blocks = chunk.len() / block_size;
            let lba32 = u32::try_from(current)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "LBA beyond READ(10) range"))?;
            self.read_10(lba32, blocks as u16, chunk)?;
            current += blocks as u64;
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pipe.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Simulated SCSI target answering CBWs from a byte vector.
    struct FakeTarget {
        disk: Vec<u8>,
        block_size: u32,
        pending: VecDeque<Vec<u8>>,
        read_commands: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
        corrupt_tag: bool,
        not_ready_once: bool,
    }

    impl FakeTarget {
        fn new(disk: Vec<u8>) -> Self {
            Self {
                disk,
                block_size: 512,
                pending: VecDeque::new(),
                read_commands: Arc::new(AtomicUsize::new(0)),
                releases: Arc::new(AtomicUsize::new(0)),
                corrupt_tag: false,
                not_ready_once: false,
            }
        }

        fn csw(&self, tag: u32, residue: u32, status: u8) -> Vec<u8> {
            let mut csw = Vec::with_capacity(CSW_LEN);
            csw.extend_from_slice(&CSW_SIGNATURE.to_le_bytes());
            let tag = if self.corrupt_tag { tag.wrapping_add(100) } else { tag };
            csw.extend_from_slice(&tag.to_le_bytes());
            csw.extend_from_slice(&residue.to_le_bytes());
            csw.push(status);
            csw
        }
    }

    impl BulkPipe for FakeTarget {
        fn bulk_out(&mut self, cbw: &[u8]) -> io::Result<()> {
            assert_eq!(cbw.len(), CBW_LEN);
            assert_eq!(&cbw[0..4], &CBW_SIGNATURE.to_le_bytes());
            let tag = u32::from_le_bytes([cbw[4], cbw[5], cbw[6], cbw[7]]);
            let transfer_len = u32::from_le_bytes([cbw[8], cbw[9], cbw[10], cbw[11]]) as usize;
            let cdb = &cbw[15..15 + cbw[14] as usize];

            let (data, status) = match cdb[0] {
                SCSI_INQUIRY => {
                    let mut d = vec![0u8; INQUIRY_LEN];
                    d[1] = 0x80;
                    d[8..16].copy_from_slice(b"SanDisk ");
                    d[16..32].copy_from_slice(b"Cruzer Blade    ");
                    (d, 0)
                }
                SCSI_TEST_UNIT_READY => {
                    let status = if self.not_ready_once { 1 } else { 0 };
                    self.not_ready_once = false;
                    (Vec::new(), status)
                }
                SCSI_REQUEST_SENSE => {
                    let mut d = vec![0u8; REQUEST_SENSE_LEN];
                    d[0] = 0x70;
                    d[2] = 0x06; // unit attention
                    (d, 0)
                }
                SCSI_READ_CAPACITY_10 => {
                    let blocks = (self.disk.len() / self.block_size as usize) as u32;
                    let mut d = (blocks - 1).to_be_bytes().to_vec();
                    d.extend_from_slice(&self.block_size.to_be_bytes());
                    (d, 0)
                }
                SCSI_READ_10 => {
                    self.read_commands.fetch_add(1, Ordering::SeqCst);
                    let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as usize;
                    let blocks = u16::from_be_bytes([cdb[7], cdb[8]]) as usize;
                    let start = lba * self.block_size as usize;
                    let end = start + blocks * self.block_size as usize;
                    (self.disk[start..end].to_vec(), 0)
                }
                _ => (Vec::new(), 1),
            };

            let sent = data.len().min(transfer_len);
            if sent > 0 {
                self.pending.push_back(data[..sent].to_vec());
            }
            let csw = self.csw(tag, (transfer_len - sent) as u32, status);
            self.pending.push_back(csw);
            Ok(())
        }

        fn bulk_in(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(mut front) = self.pending.pop_front() else {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "nothing queued"));
            };
            let count = front.len().min(buf.len());
            buf[..count].copy_from_slice(&front[..count]);
            if count < front.len() {
                self.pending.push_front(front.split_off(count));
            }
            Ok(count)
        }

        fn release(&mut self) -> io::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn test_encode_cbw_layout() {
        let cbw = encode_cbw(0x0102_0304, 512, true, 0, &[SCSI_READ_10, 0, 0, 0, 0, 8, 0, 0, 1, 0]);
        assert_eq!(&cbw[0..4], b"USBC");
        assert_eq!(&cbw[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&cbw[8..12], &512u32.to_le_bytes());
        assert_eq!(cbw[12], 0x80);
        assert_eq!(cbw[14], 10);
        assert_eq!(cbw[15], SCSI_READ_10);
        assert_eq!(cbw[20], 8);
        assert!(cbw[25..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_decode_csw() {
        let mut bytes = b"USBS".to_vec();
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.push(1);
        let csw = decode_csw(&bytes).unwrap();
        assert_eq!(csw.tag, 7);
        assert_eq!(csw.status, CommandStatus::Failed);

        bytes[0] = b'X';
        assert!(decode_csw(&bytes).is_err());
        assert!(decode_csw(&bytes[..12]).is_err());
    }

    #[test]
    fn test_init_reads_capacity() {
        let device = BotBlockDevice::init(FakeTarget::new(patterned(512 * 64))).unwrap();
        assert_eq!(device.block_size(), 512);
        assert_eq!(device.block_count(), 64);
    }

    #[test]
    fn test_init_recovers_from_unit_attention() {
        let mut target = FakeTarget::new(patterned(512 * 8));
        target.not_ready_once = true;
        let device = BotBlockDevice::init(target).unwrap();
        assert_eq!(device.block_count(), 8);
    }

    #[test]
    fn test_read_blocks_returns_disk_bytes() {
        let disk = patterned(512 * 64);
        let mut device = BotBlockDevice::init(FakeTarget::new(disk.clone())).unwrap();
        let mut buf = vec![0u8; 512 * 3];
        device.read_blocks(5, &mut buf).unwrap();
        assert_eq!(buf, disk[512 * 5..512 * 8]);
    }

    #[test]
    fn test_large_read_is_split_into_transfers() {
        let disk = patterned(512 * 400);
        let target = FakeTarget::new(disk.clone());
        let reads = Arc::clone(&target.read_commands);
        let mut device = BotBlockDevice::init(target).unwrap();

        // 300 blocks = 150 KiB, split at 64 KiB (128 blocks): 128 + 128 + 44
        let mut buf = vec![0u8; 512 * 300];
        device.read_blocks(10, &mut buf).unwrap();
        assert_eq!(buf, disk[512 * 10..512 * 310]);
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_read_past_end_is_rejected() {
        let mut device = BotBlockDevice::init(FakeTarget::new(patterned(512 * 8))).unwrap();
        let mut buf = vec![0u8; 512 * 2];
        let err = device.read_blocks(7, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_unaligned_read_is_rejected() {
        let mut device = BotBlockDevice::init(FakeTarget::new(patterned(512 * 8))).unwrap();
        let mut buf = vec![0u8; 100];
        assert_eq!(
            device.read_blocks(0, &mut buf).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_tag_mismatch_is_protocol_error() {
        let mut target = FakeTarget::new(patterned(512 * 8));
        target.corrupt_tag = true;
        let err = BotBlockDevice::init(target).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_close_releases_once() {
        let target = FakeTarget::new(patterned(512 * 8));
        let releases = Arc::clone(&target.releases);
        let mut device = BotBlockDevice::init(target).unwrap();
        device.close().unwrap();
        device.close().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);

        let mut buf = vec![0u8; 512];
        assert_eq!(
            device.read_blocks(0, &mut buf).unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }

    #[test]
    fn test_inquiry_parse() {
        let mut bytes = vec![0u8; INQUIRY_LEN];
        bytes[0] = 0x00;
        bytes[1] = 0x80;
        bytes[8..16].copy_from_slice(b"Kingston");
        bytes[16..32].copy_from_slice(b"DataTraveler 3.0");
        let inquiry = InquiryData::parse(&bytes);
        assert_eq!(inquiry.vendor, "Kingston");
        assert_eq!(inquiry.product, "DataTraveler 3.0");
        assert!(inquiry.removable);
        assert_eq!(inquiry.peripheral_device_type, 0);
    }
}
