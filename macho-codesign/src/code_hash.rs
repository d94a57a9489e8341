// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Paged hashing of code.

The Code Directory records one digest per page of the signed code region.
The kernel verifies each page against its digest as it is faulted in, so the
page boundaries here must agree exactly with the page size recorded in the
Code Directory header.

The final page is hashed over the remaining tail bytes only. It is never
padded out to a full page.
*/

use crate::{embedded_signature::DigestType, error::MachoCodesignError};

/// Whether `page_size` is usable as a Code Directory page size.
///
/// The header stores the page size as a base 2 logarithm in a single byte.
pub fn validate_page_size(page_size: usize) -> Result<(), MachoCodesignError> {
    if page_size.is_power_of_two() && page_size.trailing_zeros() < 32 {
        Ok(())
    } else {
        Err(MachoCodesignError::InvalidPageSize(page_size))
    }
}

/// The number of page digests a code region of `code_limit` bytes produces.
pub fn page_count(code_limit: usize, page_size: usize) -> usize {
    if code_limit == 0 {
        0
    } else {
        (code_limit + page_size - 1) / page_size
    }
}

/// Compute paged hashes.
///
/// `data` is chunked into `page_size` pieces and every chunk is digested
/// independently, in order.
pub fn paged_digests(
    data: &[u8],
    hash: DigestType,
    page_size: usize,
) -> Result<Vec<Vec<u8>>, MachoCodesignError> {
    validate_page_size(page_size)?;

    data.chunks(page_size)
        .map(|chunk| hash.digest_data(chunk))
        .collect::<Result<Vec<_>, MachoCodesignError>>()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(page_count(0, 4096), 0);
        assert_eq!(page_count(1, 4096), 1);
        assert_eq!(page_count(4096, 4096), 1);
        assert_eq!(page_count(4097, 4096), 2);
        assert_eq!(page_count(16384 * 3, 16384), 3);
    }

    #[test]
    fn digest_count_matches_page_count() -> Result<(), MachoCodesignError> {
        for len in [0usize, 1, 4095, 4096, 4097, 10000] {
            let data = vec![0x42; len];
            let digests = paged_digests(&data, DigestType::Sha256, 4096)?;
            assert_eq!(digests.len(), page_count(len, 4096));
        }

        Ok(())
    }

    #[test]
    fn tail_page_covers_only_remaining_bytes() -> Result<(), MachoCodesignError> {
        let data = vec![7u8; 5000];
        let digests = paged_digests(&data, DigestType::Sha256, 4096)?;

        assert_eq!(digests[0], DigestType::Sha256.digest_data(&data[0..4096])?);
        assert_eq!(digests[1], DigestType::Sha256.digest_data(&data[4096..])?);

        let mut padded = data[4096..].to_vec();
        padded.resize(4096, 0);
        assert_ne!(digests[1], DigestType::Sha256.digest_data(&padded)?);

        Ok(())
    }

    #[test]
    fn single_byte_change_changes_one_page() -> Result<(), MachoCodesignError> {
        let mut data = vec![0u8; 3 * 4096];
        let before = paged_digests(&data, DigestType::Sha256, 4096)?;
        data[4096 + 17] ^= 0x01;
        let after = paged_digests(&data, DigestType::Sha256, 4096)?;

        assert_eq!(before[0], after[0]);
        assert_ne!(before[1], after[1]);
        assert_eq!(before[2], after[2]);

        Ok(())
    }

    #[test]
    fn rejects_bad_page_size() {
        assert!(paged_digests(b"abc", DigestType::Sha256, 3000).is_err());
        assert!(validate_page_size(0).is_err());
        assert!(validate_page_size(16384).is_ok());
    }
}
