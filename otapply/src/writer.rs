// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Block-level reads and writes against a target device, addressed by extent
//! lists instead of byte offsets.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
};

use crate::{format::extents::is_sparse_hole, protobuf::update_engine::Extent};

// Extent fields come from the untrusted manifest, so the block math must not
// be allowed to overflow.
fn extent_overflow() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        "Extent exceeds the addressable range",
    )
}

/// Writer that lays a byte stream across a list of extents, in order. Bytes
/// aimed at a sparse hole are counted but dropped. [`Self::finish`] must be
/// called to zero-fill the remainder of the final block.
pub struct ExtentWriter<'a> {
    file: &'a mut File,
    extents: &'a [Extent],
    block_size: u64,
    /// Index of the extent currently being filled.
    index: usize,
    /// Bytes already written into the current extent.
    extent_written: u64,
    total_written: u64,
}

impl<'a> ExtentWriter<'a> {
    pub fn new(file: &'a mut File, extents: &'a [Extent], block_size: u64) -> Self {
        Self {
            file,
            extents,
            block_size,
            index: 0,
            extent_written: 0,
            total_written: 0,
        }
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Zero-fills the rest of the final block so that stale bytes from the
    /// previous image never survive within a written block.
    pub fn finish(mut self) -> io::Result<()> {
        let partial = self.total_written % self.block_size;
        if partial != 0 {
            let zeroes = vec![0u8; (self.block_size - partial) as usize];
            self.write_all(&zeroes)?;
        }

        self.flush()
    }
}

impl Write for ExtentWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let Some(extent) = self.extents.get(self.index) else {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "Write past the end of the destination extents",
            ));
        };

        let extent_size = extent
            .num_blocks()
            .checked_mul(self.block_size)
            .ok_or_else(extent_overflow)?;
        let remaining = extent_size - self.extent_written;
        let count = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));

        if !is_sparse_hole(extent) {
            let offset = extent
                .start_block()
                .checked_mul(self.block_size)
                .and_then(|o| o.checked_add(self.extent_written))
                .ok_or_else(extent_overflow)?;
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(&buf[..count])?;
        }

        self.extent_written += count as u64;
        self.total_written += count as u64;

        if self.extent_written == extent_size {
            self.index += 1;
            self.extent_written = 0;
        }

        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Reads `length` bytes laid out across the extents, in order. Sparse holes
/// read as zeros.
pub fn read_extents(
    file: &mut File,
    extents: &[Extent],
    block_size: u64,
    length: u64,
) -> io::Result<Vec<u8>> {
    let length = usize::try_from(length)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Read length too large"))?;
    let mut data = Vec::with_capacity(length);

    for extent in extents {
        let remaining = length - data.len();
        if remaining == 0 {
            break;
        }

        let extent_size = extent
            .num_blocks()
            .checked_mul(block_size)
            .ok_or_else(extent_overflow)?;
        let count = extent_size.min(remaining as u64) as usize;

        if is_sparse_hole(extent) {
            data.resize(data.len() + count, 0);
        } else {
            let offset = extent
                .start_block()
                .checked_mul(block_size)
                .ok_or_else(extent_overflow)?;
            file.seek(SeekFrom::Start(offset))?;

            let start = data.len();
            data.resize(start + count, 0);
            file.read_exact(&mut data[start..])?;
        }
    }

    if data.len() != length {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Source extents are smaller than the requested length",
        ));
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom, Write};

    use crate::{format::extents::SPARSE_HOLE, protobuf::update_engine::Extent};

    use super::{ExtentWriter, read_extents};

    const BLOCK_SIZE: u64 = 16;

    fn extent(start_block: u64, num_blocks: u64) -> Extent {
        Extent {
            start_block: Some(start_block),
            num_blocks: Some(num_blocks),
        }
    }

    fn temp_device(blocks: u64) -> std::fs::File {
        let mut file = tempfile::tempfile().unwrap();
        let data = (0..blocks * BLOCK_SIZE).map(|i| i as u8).collect::<Vec<_>>();
        file.write_all(&data).unwrap();
        file
    }

    fn read_all(file: &mut std::fs::File) -> Vec<u8> {
        let mut data = vec![];
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut data).unwrap();
        data
    }

    #[test]
    fn write_across_extents_in_order() {
        let mut file = temp_device(4);
        let extents = [extent(2, 1), extent(0, 1)];

        let payload = (0u8..32).map(|i| i.wrapping_add(100)).collect::<Vec<_>>();
        let mut writer = ExtentWriter::new(&mut file, &extents, BLOCK_SIZE);
        writer.write_all(&payload).unwrap();
        writer.finish().unwrap();

        let contents = read_all(&mut file);
        assert_eq!(&contents[32..48], &payload[..16]);
        assert_eq!(&contents[0..16], &payload[16..]);
        // Untouched blocks keep their original contents.
        assert_eq!(contents[16], 16);
    }

    #[test]
    fn finish_zero_fills_final_block() {
        let mut file = temp_device(2);
        let extents = [extent(1, 1)];

        let mut writer = ExtentWriter::new(&mut file, &extents, BLOCK_SIZE);
        writer.write_all(b"abc").unwrap();
        writer.finish().unwrap();

        let contents = read_all(&mut file);
        assert_eq!(&contents[16..19], b"abc");
        assert!(contents[19..32].iter().all(|b| *b == 0));
    }

    #[test]
    fn writes_to_holes_are_dropped() {
        let mut file = temp_device(3);
        let extents = [extent(SPARSE_HOLE, 1), extent(1, 1)];

        let payload = vec![0xaa; 32];
        let mut writer = ExtentWriter::new(&mut file, &extents, BLOCK_SIZE);
        writer.write_all(&payload).unwrap();
        writer.finish().unwrap();

        let contents = read_all(&mut file);
        // First block keeps the device's original pattern.
        let original = (0u8..16).collect::<Vec<_>>();
        assert_eq!(&contents[0..16], &original[..]);
        assert!(contents[16..32].iter().all(|b| *b == 0xaa));
    }

    #[test]
    fn write_past_extents_fails() {
        let mut file = temp_device(1);
        let extents = [extent(0, 1)];

        let mut writer = ExtentWriter::new(&mut file, &extents, BLOCK_SIZE);
        assert!(writer.write_all(&vec![0u8; 17]).is_err());
    }

    #[test]
    fn read_with_holes_and_cap() {
        let mut file = temp_device(4);
        let extents = [extent(1, 1), extent(SPARSE_HOLE, 1), extent(3, 1)];

        let data = read_extents(&mut file, &extents, BLOCK_SIZE, 40).unwrap();
        assert_eq!(data.len(), 40);
        assert_eq!(data[0], 16);
        assert!(data[16..32].iter().all(|b| *b == 0));
        assert_eq!(data[32], 48);
    }

    #[test]
    fn oversized_extents_fail_cleanly() {
        let mut file = temp_device(1);

        let huge = [extent(2, u64::MAX / BLOCK_SIZE + 1)];
        let mut writer = ExtentWriter::new(&mut file, &huge, BLOCK_SIZE);
        assert!(writer.write_all(b"x").is_err());
        assert!(read_extents(&mut file, &huge, BLOCK_SIZE, 16).is_err());

        let far = [extent(u64::MAX - 1, 1)];
        let mut writer = ExtentWriter::new(&mut file, &far, BLOCK_SIZE);
        assert!(writer.write_all(b"x").is_err());
        assert!(read_extents(&mut file, &far, BLOCK_SIZE, 16).is_err());
    }

    #[test]
    fn read_past_extents_fails() {
        let mut file = temp_device(1);
        let extents = [extent(0, 1)];

        assert!(read_extents(&mut file, &extents, BLOCK_SIZE, 17).is_err());
    }
}
