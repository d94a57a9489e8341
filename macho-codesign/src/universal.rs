// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fat/universal Mach-O container writing.

use {
    crate::error::{FormatError, MachoCodesignError},
    goblin::mach::fat::{FatArch, FAT_MAGIC, SIZEOF_FAT_ARCH, SIZEOF_FAT_HEADER},
    scroll::{IOwrite, Pwrite},
    std::io::Write,
};

/// Alignment (as a power of 2) used when an architecture doesn't declare one.
///
/// x86-64 would be fine with 4k. 16k satisfies aarch64 as well.
pub const DEFAULT_ALIGN: u32 = 14;

/// A thin Mach-O image destined for a fat container.
#[derive(Clone, Copy, Debug)]
pub struct UniversalSlice<'a> {
    pub cputype: u32,
    pub cpusubtype: u32,
    /// Required alignment of the slice offset, as a power of 2.
    pub align: u32,
    pub data: &'a [u8],
}

fn align_up(value: u64, align: u64) -> u64 {
    match value % align {
        0 => value,
        rem => value + align - rem,
    }
}

/// Compute fat arch records for slices laid out back to back.
///
/// Every slice starts at the next offset satisfying its own alignment.
pub fn layout_slices(slices: &[UniversalSlice]) -> Result<Vec<FatArch>, MachoCodesignError> {
    let mut offset = (SIZEOF_FAT_HEADER + slices.len() * SIZEOF_FAT_ARCH) as u64;

    let mut records = Vec::with_capacity(slices.len());

    for slice in slices {
        if slice.align >= 32 {
            return Err(FormatError::Unsupported(format!(
                "fat slice alignment 2^{}",
                slice.align
            ))
            .into());
        }

        offset = align_up(offset, 1u64 << slice.align);

        let size = slice.data.len() as u64;

        if offset + size > u32::MAX as u64 {
            return Err(FormatError::Unsupported(
                "universal binary larger than 4 GiB requires 64-bit fat headers".into(),
            )
            .into());
        }

        records.push(FatArch {
            cputype: slice.cputype,
            cpusubtype: slice.cpusubtype,
            offset: offset as u32,
            size: size as u32,
            align: slice.align,
        });

        offset += size;
    }

    Ok(records)
}

/// Write a universal Mach-O binary containing the given slices.
///
/// The fat header records are big-endian. Gaps between slices are NULL.
pub fn write_universal_macho<'a>(
    writer: &mut impl Write,
    slices: impl IntoIterator<Item = UniversalSlice<'a>>,
) -> Result<(), MachoCodesignError> {
    let slices = slices.into_iter().collect::<Vec<_>>();
    let records = layout_slices(&slices)?;

    writer.iowrite_with(FAT_MAGIC, scroll::BE)?;
    writer.iowrite_with(records.len() as u32, scroll::BE)?;

    for record in &records {
        let mut buffer = [0u8; SIZEOF_FAT_ARCH];
        buffer.pwrite_with(record, 0, scroll::BE)?;
        writer.write_all(&buffer)?;
    }

    let mut position = (SIZEOF_FAT_HEADER + records.len() * SIZEOF_FAT_ARCH) as u64;

    for (record, slice) in records.iter().zip(slices) {
        writer.write_all(&vec![0u8; (record.offset as u64 - position) as usize])?;
        writer.write_all(slice.data)?;
        position = record.offset as u64 + record.size as u64;
    }

    Ok(())
}

/// [write_universal_macho] into a new buffer.
pub fn create_universal_macho<'a>(
    slices: impl IntoIterator<Item = UniversalSlice<'a>>,
) -> Result<Vec<u8>, MachoCodesignError> {
    let mut buffer = vec![];
    write_universal_macho(&mut buffer, slices)?;

    Ok(buffer)
}

#[cfg(test)]
mod test {
    use {super::*, scroll::Pread};

    #[test]
    fn first_slice_offset_is_aligned() -> Result<(), MachoCodesignError> {
        let a = vec![1u8; 100];
        let b = vec![2u8; 50];

        let data = create_universal_macho([
            UniversalSlice {
                cputype: 0x01000007,
                cpusubtype: 3,
                align: 12,
                data: &a,
            },
            UniversalSlice {
                cputype: 0x0100000c,
                cpusubtype: 0,
                align: DEFAULT_ALIGN,
                data: &b,
            },
        ])?;

        assert_eq!(data.pread_with::<u32>(0, scroll::BE)?, FAT_MAGIC);
        assert_eq!(data.pread_with::<u32>(4, scroll::BE)?, 2);

        let first = data.pread_with::<FatArch>(8, scroll::BE)?;
        assert_eq!(first.offset, 4096);
        assert_eq!(first.size, 100);
        assert_eq!(first.align, 12);

        let second = data.pread_with::<FatArch>(8 + SIZEOF_FAT_ARCH, scroll::BE)?;
        assert_eq!(second.offset, 16384);
        assert_eq!(second.align, 14);

        assert_eq!(&data[4096..4196], a.as_slice());
        assert_eq!(&data[16384..], b.as_slice());
        assert!(data[8 + 2 * SIZEOF_FAT_ARCH..4096].iter().all(|b| *b == 0));

        Ok(())
    }
}
