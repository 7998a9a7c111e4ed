//! Generates the `stratus.1` man page from the clap definitions.
//!
//! Packaging picks the page up from `OUT_DIR`, so it is rendered on every
//! build where the CLI definitions change.

use std::env;
use std::io::{self, Write};

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

const MAN_PAGE: &str = "stratus.1";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let raw_out_dir = env::var_os("OUT_DIR")
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR was not set"))?;
    let out_dir = Utf8PathBuf::from_path_buf(raw_out_dir.into())
        .map_err(|path| io::Error::new(io::ErrorKind::InvalidData, path.display().to_string()))?;

    let mut page = Vec::new();
    Man::new(cli::Cli::command()).render(&mut page)?;

    Dir::open_ambient_dir(&out_dir, ambient_authority())?.write(MAN_PAGE, page)?;
    Ok(())
}
