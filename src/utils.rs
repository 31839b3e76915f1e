use std::path::Path;

use tracing::info;

use crate::sink::EncoderProgram;
use crate::{Error, Result};

/// Finds the encoder executable, either a path or a name on `PATH`.
pub fn resolve_encoder(program: &str, prefix_args: &[String]) -> Result<EncoderProgram> {
    let path = which::which(program).map_err(|e| Error::DeviceUnavailable {
        device: program.to_string(),
        reason: format!("encoder executable not found: {e}"),
    })?;
    info!("Using encoder {}", path.display());

    Ok(EncoderProgram {
        path,
        prefix_args: prefix_args.to_vec(),
    })
}

/// Usable output directory: an existing directory, or one that can be created.
pub fn check_output_dir(dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() {
        return Err(Error::invalid("output directory", "path is empty"));
    }
    if dir.exists() && !dir.is_dir() {
        return Err(Error::invalid(
            "output directory",
            format!("{} is not a directory", dir.display()),
        ));
    }
    Ok(())
}
