//! Zip archive writer for chapter bundles.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bookforge_common::{Error, Result};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

fn zip_err(e: zip::result::ZipError) -> Error {
    Error::Internal(format!("zip: {e}"))
}

/// Write `files` into a deflated zip at `dest`, in the given order.
///
/// Entries are stored under their file names. The archive is written to a
/// sibling `.part` file and renamed into place, so a failed write never
/// leaves a truncated archive at `dest`.
pub fn write_zip(dest: &Path, files: &[PathBuf]) -> Result<()> {
    let partial = dest.with_extension("zip.part");

    let result = (|| -> Result<()> {
        let mut zip = ZipWriter::new(BufWriter::new(File::create(&partial)?));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for path in files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| Error::Validation(format!("not a file: {}", path.display())))?;
            zip.start_file(name, options).map_err(zip_err)?;
            let mut src = File::open(path)?;
            std::io::copy(&mut src, &mut zip)?;
        }

        let mut out = zip.finish().map_err(zip_err)?;
        out.flush()?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            std::fs::rename(&partial, dest)?;
            tracing::debug!(dest = %dest.display(), entries = files.len(), "Wrote archive");
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            Err(e)
        }
    }
}
