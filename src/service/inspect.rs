//! Single-pass inspection of an upload stream
//!
//! The body is read exactly once: every chunk is fed to the SHA-256 hasher,
//! appended to a spool and, for the first bytes, kept aside for sniffing.

use std::io::{Read, Seek, SeekFrom, Write};

use log::debug;
use sha2::{Digest, Sha256};
use tempfile::SpooledTempFile;

use crate::error::{VaultError, VaultResult};
use crate::metadata::ContentHash;
use crate::service::sniff::SNIFF_LEN;
use crate::service::user_context::RequestContext;
use crate::storage::COPY_CHUNK_SIZE;

/// A fully read upload, rewound and ready to be staged
pub struct InspectedUpload {
    pub hash: ContentHash,
    pub size: u64,
    pub head: Vec<u8>,
    pub spool: SpooledTempFile,
}

impl InspectedUpload {
    pub fn reader(&mut self) -> &mut SpooledTempFile {
        &mut self.spool
    }
}

/// Read `source` to the end, refusing more than `max_size` bytes
pub fn inspect_stream(
    ctx: &RequestContext,
    source: &mut dyn Read,
    max_size: u64,
    spool_threshold: usize,
) -> VaultResult<InspectedUpload> {
    let mut hasher = Sha256::new();
    let mut spool = SpooledTempFile::new(spool_threshold);
    let mut head = Vec::with_capacity(SNIFF_LEN);
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut size: u64 = 0;

    loop {
        ctx.check_deadline()?;
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        size += n as u64;
        if size > max_size {
            return Err(VaultError::Validation(format!(
                "upload exceeds the maximum size of {} bytes",
                max_size
            )));
        }

        let chunk = &buf[..n];
        hasher.update(chunk);
        if head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - head.len()).min(n);
            head.extend_from_slice(&chunk[..take]);
        }
        spool.write_all(chunk)?;
    }

    spool.seek(SeekFrom::Start(0))?;
    let hash = ContentHash::from_digest(&hasher.finalize());
    debug!("Inspected upload: {} bytes, sha256 {}", size, hash);

    Ok(InspectedUpload {
        hash,
        size,
        head,
        spool,
    })
}
