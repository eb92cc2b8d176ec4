//! Build-context archives: tar for the local engine, zip for remote builds.

use stagehand_core::{Error, Result};
use std::io::{Cursor, Write};
use std::path::Path;
use tracing::debug;
use zip::write::SimpleFileOptions;

use crate::ignore::IgnoreRules;

fn zip_error(err: zip::result::ZipError) -> Error {
    Error::Io(std::io::Error::other(err))
}

/// Tar every included file of `context_dir`.
pub fn tar_context(context_dir: &Path, rules: &IgnoreRules) -> Result<Vec<u8>> {
    let files = rules.collect_files(context_dir)?;
    let mut builder = tar::Builder::new(Vec::new());
    for (path, relative) in &files {
        builder.append_path_with_name(path, relative)?;
    }
    let bytes = builder.into_inner()?;
    debug!(files = files.len(), bytes = bytes.len(), "Archived build context (tar)");
    Ok(bytes)
}

/// Zip every included file of `context_dir`.
pub fn zip_context(context_dir: &Path, rules: &IgnoreRules) -> Result<Vec<u8>> {
    let files = rules.collect_files(context_dir)?;
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (path, relative) in &files {
        zip.start_file(relative.as_str(), options).map_err(zip_error)?;
        zip.write_all(&std::fs::read(path)?)?;
    }
    let bytes = zip.finish().map_err(zip_error)?.into_inner();
    debug!(files = files.len(), bytes = bytes.len(), "Archived build context (zip)");
    Ok(bytes)
}
