//! Archive Writer: serializes finished [`Probe`] records and appends
//! them to a rotating tar container on disk.
//!
//! Each record is bincode-encoded, LZO1X-compressed, then appended as
//! one tar entry with a fixed, content-independent header (`uid`/`gid`
//! `0`, mode `0o444`, `mtime` taken from the probe's first circuit
//! event) so that two archives of the same probes are byte-identical
//! regardless of when they were written to disk.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::record::Probe;

/// Archive shards roll over once their uncompressed tar payload
/// exceeds this many bytes.
const ROTATE_AFTER_BYTES: u64 = 1 << 30;

/// Runs on a dedicated blocking thread, receiving finished probes over
/// `rx` and appending them to `dir/<prefix><NNN>` shards, 1-indexed and
/// zero-padded to three digits (`spec.md` §6).
pub struct ArchiveWriter {
    dir: PathBuf,
    prefix: String,
    shard_index: u32,
    builder: tar::Builder<File>,
    bytes_written: u64,
}

impl ArchiveWriter {
    /// Open (creating if needed) the archive directory and its first
    /// shard, named `<prefix>001`.
    pub fn open(dir: PathBuf, prefix: String) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let first_shard = dir.join(format!("{prefix}001"));
        Ok(Self {
            dir,
            prefix,
            shard_index: 1,
            builder: tar::Builder::new(File::create(first_shard)?),
            bytes_written: 0,
        })
    }

    fn shard_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{}{index:03}", self.prefix))
    }

    fn open_shard(&self, index: u32) -> std::io::Result<File> {
        File::create(self.shard_path(index))
    }

    /// Drain `rx` until the sender side is dropped, writing every
    /// probe received. Runs synchronously; spawn with
    /// [`tokio::task::spawn_blocking`].
    pub fn run(mut self, mut rx: mpsc::UnboundedReceiver<Probe>) {
        while let Some(probe) = rx.blocking_recv() {
            if let Err(e) = self.append(&probe) {
                tracing::error!(error = %e, "failed to archive probe record");
            }
        }
        if let Err(e) = self.builder.finish() {
            tracing::error!(error = %e, "failed to finalize archive shard");
        }
    }

    fn append(&mut self, probe: &Probe) -> std::io::Result<()> {
        let encoded = bincode::serialize(probe)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let compressed = compress(&encoded)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let name = format!("Probe_{}.lzo", probe.dest);
        let mtime = probe
            .circs
            .first()
            .map(|e| e.created_at.unix_timestamp() as u64)
            .unwrap_or(0);

        let mut header = tar::Header::new_gnu();
        header.set_path(&name)?;
        header.set_size(compressed.len() as u64);
        header.set_mode(0o444);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(mtime);
        header.set_cksum();

        self.builder.append(&header, compressed.as_slice())?;
        self.bytes_written += compressed.len() as u64;

        if self.bytes_written >= ROTATE_AFTER_BYTES {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        let next_index = self.shard_index + 1;
        let next_file = self.open_shard(next_index)?;
        let old = std::mem::replace(&mut self.builder, tar::Builder::new(next_file));
        old.into_inner()?.flush()?;
        self.shard_index = next_index;
        self.bytes_written = 0;
        Ok(())
    }
}

/// LZO1X-compress `data` via the pure-Rust `lzokay` codec.
///
/// Errors propagate rather than falling back to storing `data`
/// uncompressed under the `.lzo`-suffixed entry name: a reader would
/// attempt to LZO-decompress it and either fail opaquely or, worse,
/// decode silently wrong bytes, breaking the
/// serialize→compress→write→read→decompress→deserialize round trip
/// `spec.md` §8 requires.
fn compress(data: &[u8]) -> Result<Vec<u8>, lzokay::Error> {
    lzokay::compress::compress_to_vec(data)
}
