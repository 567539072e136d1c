//! CompactFlash / IDE controller, file-backed.
//!
//! Stands in for the disk-image library behind its consumed
//! interface: `allocate`, `attach`, `reset_begin`, `read8`, `write8`.
//! The eight task-file registers sit at ports 0..7.  Enough of the
//! ATA command set is implemented to boot and run a CF-resident
//! operating system: IDENTIFY DEVICE, READ SECTORS, and WRITE
//! SECTORS, all LBA28 through the 8-bit data port.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

const SECTOR_SIZE: usize = 512;

// Status register bits.
const ST_ERR: u8 = 0x01;
const ST_DRQ: u8 = 0x08;
const ST_DSC: u8 = 0x10;
const ST_DRDY: u8 = 0x40;

// Error register bits.
const ERR_ABRT: u8 = 0x04;
const ERR_IDNF: u8 = 0x10;

// Commands.
const CMD_READ_SECTORS: u8 = 0x20;
const CMD_READ_SECTORS_NR: u8 = 0x21;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_WRITE_SECTORS_NR: u8 = 0x31;
const CMD_IDENTIFY: u8 = 0xEC;
const CMD_SET_FEATURES: u8 = 0xEF;

#[derive(Clone, Copy, PartialEq)]
enum Transfer {
    None,
    /// Sectors still to hand to the host (buffer already loaded).
    Read(u16),
    /// Sectors still to take from the host.
    Write(u16),
}

pub struct IdeController {
    disk: Option<File>,
    sectors: u32,
    error: u8,
    count: u8,
    lba: [u8; 3],
    devh: u8,
    status: u8,
    buf: [u8; SECTOR_SIZE],
    bufpos: usize,
    xfer: Transfer,
}

impl IdeController {
    /// Allocate a controller of the given kind; only "cf" exists.
    pub fn allocate(kind: &str) -> Option<IdeController> {
        if kind != "cf" {
            return None;
        }
        Some(IdeController {
            disk: None,
            sectors: 0,
            error: 0,
            count: 1,
            lba: [0; 3],
            devh: 0xE0,
            status: ST_DRDY | ST_DSC,
            buf: [0; SECTOR_SIZE],
            bufpos: 0,
            xfer: Transfer::None,
        })
    }

    /// Attach a disk image to the (only) drive slot.
    pub fn attach(&mut self, slot: usize, file: File) -> io::Result<()> {
        if slot != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "only drive 0 is wired",
            ));
        }
        let len = file.metadata()?.len();
        self.sectors = (len / SECTOR_SIZE as u64) as u32;
        self.disk = Some(file);
        Ok(())
    }

    /// Power-on/reset sequencing.
    pub fn reset_begin(&mut self) {
        self.error = 0;
        self.count = 1;
        self.lba = [0; 3];
        self.devh = 0xE0;
        self.status = ST_DRDY | ST_DSC;
        self.xfer = Transfer::None;
        self.bufpos = 0;
    }

    fn lba28(&self) -> u32 {
        ((self.devh as u32 & 0x0F) << 24)
            | ((self.lba[2] as u32) << 16)
            | ((self.lba[1] as u32) << 8)
            | self.lba[0] as u32
    }

    fn fail(&mut self, err: u8) {
        self.error = err;
        self.status = ST_DRDY | ST_DSC | ST_ERR;
        self.xfer = Transfer::None;
    }

    fn load_sector(&mut self, lba: u32) -> bool {
        if lba >= self.sectors {
            return false;
        }
        let Some(disk) = self.disk.as_mut() else {
            return false;
        };
        if disk
            .seek(SeekFrom::Start(lba as u64 * SECTOR_SIZE as u64))
            .and_then(|_| disk.read_exact(&mut self.buf))
            .is_err()
        {
            return false;
        }
        self.bufpos = 0;
        true
    }

    fn store_sector(&mut self, lba: u32) -> bool {
        if lba >= self.sectors {
            return false;
        }
        let Some(disk) = self.disk.as_mut() else {
            return false;
        };
        disk.seek(SeekFrom::Start(lba as u64 * SECTOR_SIZE as u64))
            .and_then(|_| disk.write_all(&self.buf))
            .is_ok()
    }

    fn advance_lba(&mut self) {
        let next = self.lba28().wrapping_add(1);
        self.lba[0] = next as u8;
        self.lba[1] = (next >> 8) as u8;
        self.lba[2] = (next >> 16) as u8;
        self.devh = (self.devh & 0xF0) | ((next >> 24) & 0x0F) as u8;
    }

    fn identify(&mut self) {
        self.buf = [0; SECTOR_SIZE];
        let heads = 16u16;
        let spt = 63u16;
        let cyls = (self.sectors / (heads as u32 * spt as u32)).min(0xFFFF) as u16;
        self.put_word(0, 0x848A); // CF signature
        self.put_word(1, cyls);
        self.put_word(3, heads);
        self.put_word(6, spt);
        self.put_string(10, 20, "00000000000000000001");
        self.put_string(23, 8, "1.0     ");
        self.put_string(27, 40, "EMULATED CF CARD");
        self.put_word(47, 0x8001);
        self.put_word(49, 0x0200); // LBA supported
        self.put_word(53, 0x0001);
        self.put_word(54, cyls);
        self.put_word(55, heads);
        self.put_word(56, spt);
        self.put_word(60, self.sectors as u16);
        self.put_word(61, (self.sectors >> 16) as u16);
        self.bufpos = 0;
    }

    fn put_word(&mut self, word: usize, val: u16) {
        self.buf[word * 2] = val as u8;
        self.buf[word * 2 + 1] = (val >> 8) as u8;
    }

    /// ATA strings are ASCII with the bytes of each word swapped.
    fn put_string(&mut self, word: usize, len: usize, s: &str) {
        let mut bytes = vec![b' '; len];
        for (i, b) in s.bytes().take(len).enumerate() {
            bytes[i] = b;
        }
        for (i, pair) in bytes.chunks(2).enumerate() {
            self.buf[(word + i) * 2] = pair[1];
            self.buf[(word + i) * 2 + 1] = pair[0];
        }
    }

    fn command(&mut self, cmd: u8) {
        self.error = 0;
        match cmd {
            CMD_IDENTIFY => {
                if self.disk.is_none() {
                    self.fail(ERR_ABRT);
                    return;
                }
                self.identify();
                self.xfer = Transfer::Read(1);
                self.status = ST_DRDY | ST_DSC | ST_DRQ;
            }
            CMD_READ_SECTORS | CMD_READ_SECTORS_NR => {
                let n = if self.count == 0 { 256 } else { self.count as u16 };
                let lba = self.lba28();
                if !self.load_sector(lba) {
                    self.fail(ERR_IDNF);
                    return;
                }
                self.xfer = Transfer::Read(n);
                self.status = ST_DRDY | ST_DSC | ST_DRQ;
            }
            CMD_WRITE_SECTORS | CMD_WRITE_SECTORS_NR => {
                let n = if self.count == 0 { 256 } else { self.count as u16 };
                if self.lba28() >= self.sectors {
                    self.fail(ERR_IDNF);
                    return;
                }
                self.bufpos = 0;
                self.xfer = Transfer::Write(n);
                self.status = ST_DRDY | ST_DSC | ST_DRQ;
            }
            CMD_SET_FEATURES => {
                self.status = ST_DRDY | ST_DSC;
            }
            _ => {
                log::warn!("ide: unsupported command {cmd:02x}");
                self.fail(ERR_ABRT);
            }
        }
    }

    /// Task-file read, ports 0..7.
    pub fn read8(&mut self, port: u8) -> u8 {
        match port & 7 {
            0 => {
                let Transfer::Read(remaining) = self.xfer else {
                    return 0xFF;
                };
                let b = self.buf[self.bufpos];
                self.bufpos += 1;
                if self.bufpos == SECTOR_SIZE {
                    if remaining > 1 {
                        self.advance_lba();
                        let lba = self.lba28();
                        if !self.load_sector(lba) {
                            self.fail(ERR_IDNF);
                            return b;
                        }
                        self.xfer = Transfer::Read(remaining - 1);
                    } else {
                        self.xfer = Transfer::None;
                        self.status = ST_DRDY | ST_DSC;
                    }
                }
                b
            }
            1 => self.error,
            2 => self.count,
            3 => self.lba[0],
            4 => self.lba[1],
            5 => self.lba[2],
            6 => self.devh,
            _ => self.status,
        }
    }

    /// Task-file write, ports 0..7.
    pub fn write8(&mut self, port: u8, val: u8) {
        match port & 7 {
            0 => {
                let Transfer::Write(remaining) = self.xfer else {
                    return;
                };
                self.buf[self.bufpos] = val;
                self.bufpos += 1;
                if self.bufpos == SECTOR_SIZE {
                    let lba = self.lba28();
                    if !self.store_sector(lba) {
                        self.fail(ERR_IDNF);
                        return;
                    }
                    self.bufpos = 0;
                    if remaining > 1 {
                        self.advance_lba();
                        self.xfer = Transfer::Write(remaining - 1);
                    } else {
                        self.xfer = Transfer::None;
                        self.status = ST_DRDY | ST_DSC;
                    }
                }
            }
            1 => {} // features
            2 => self.count = val,
            3 => self.lba[0] = val,
            4 => self.lba[1] = val,
            5 => self.lba[2] = val,
            6 => self.devh = val,
            _ => self.command(val),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::path::PathBuf;

    fn scratch_image(name: &str, sectors: usize) -> (IdeController, PathBuf) {
        let path = std::env::temp_dir().join(format!("rcbus-ide-{}-{}", std::process::id(), name));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len((sectors * SECTOR_SIZE) as u64).unwrap();
        let mut ide = IdeController::allocate("cf").unwrap();
        ide.attach(0, file).unwrap();
        ide.reset_begin();
        (ide, path)
    }

    fn set_lba(ide: &mut IdeController, lba: u32, count: u8) {
        ide.write8(2, count);
        ide.write8(3, lba as u8);
        ide.write8(4, (lba >> 8) as u8);
        ide.write8(5, (lba >> 16) as u8);
        ide.write8(6, 0xE0 | ((lba >> 24) & 0x0F) as u8);
    }

    #[test]
    fn identify_reports_capacity_and_drq() {
        let (mut ide, path) = scratch_image("ident", 64);
        ide.write8(7, CMD_IDENTIFY);
        assert_eq!(ide.read8(7) & (ST_DRQ | ST_DRDY), ST_DRQ | ST_DRDY);
        let mut block = [0u8; SECTOR_SIZE];
        for b in block.iter_mut() {
            *b = ide.read8(0);
        }
        // Word 60/61: LBA sector count.
        let total = block[120] as u32
            | ((block[121] as u32) << 8)
            | ((block[122] as u32) << 16)
            | ((block[123] as u32) << 24);
        assert_eq!(total, 64);
        assert_eq!(ide.read8(7) & ST_DRQ, 0);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn write_then_read_round_trips() {
        let (mut ide, path) = scratch_image("rw", 16);
        set_lba(&mut ide, 3, 1);
        ide.write8(7, CMD_WRITE_SECTORS);
        assert_eq!(ide.read8(7) & ST_DRQ, ST_DRQ);
        for i in 0..SECTOR_SIZE {
            ide.write8(0, (i & 0xFF) as u8);
        }
        assert_eq!(ide.read8(7) & ST_DRQ, 0);

        set_lba(&mut ide, 3, 1);
        ide.write8(7, CMD_READ_SECTORS);
        for i in 0..SECTOR_SIZE {
            assert_eq!(ide.read8(0), (i & 0xFF) as u8);
        }
        assert_eq!(ide.read8(7), ST_DRDY | ST_DSC);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn out_of_range_lba_sets_error() {
        let (mut ide, path) = scratch_image("oob", 4);
        set_lba(&mut ide, 100, 1);
        ide.write8(7, CMD_READ_SECTORS);
        let st = ide.read8(7);
        assert_eq!(st & ST_ERR, ST_ERR);
        assert_eq!(ide.read8(1), ERR_IDNF);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn unsupported_command_aborts() {
        let (mut ide, path) = scratch_image("abrt", 4);
        ide.write8(7, 0xA1); // IDENTIFY PACKET: not an ATA disk
        assert_eq!(ide.read8(7) & ST_ERR, ST_ERR);
        assert_eq!(ide.read8(1), ERR_ABRT);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn multi_sector_read_crosses_boundaries() {
        let (mut ide, path) = scratch_image("multi", 8);
        // Seed two sectors with distinct fills.
        for (lba, fill) in [(2u32, 0x11u8), (3, 0x22)] {
            set_lba(&mut ide, lba, 1);
            ide.write8(7, CMD_WRITE_SECTORS);
            for _ in 0..SECTOR_SIZE {
                ide.write8(0, fill);
            }
        }
        set_lba(&mut ide, 2, 2);
        ide.write8(7, CMD_READ_SECTORS);
        for _ in 0..SECTOR_SIZE {
            assert_eq!(ide.read8(0), 0x11);
        }
        for _ in 0..SECTOR_SIZE {
            assert_eq!(ide.read8(0), 0x22);
        }
        assert_eq!(ide.read8(7) & ST_DRQ, 0);
        std::fs::remove_file(path).ok();
    }
}
