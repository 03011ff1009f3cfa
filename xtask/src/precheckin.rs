// Licensed under the Apache-2.0 license

use anyhow::Result;

use crate::cargo;

pub(crate) fn precheckin() -> Result<()> {
    format()?;
    clippy()?;
    test()
}

pub(crate) fn format() -> Result<()> {
    cargo(&["fmt", "--all", "--check"])
}

pub(crate) fn clippy() -> Result<()> {
    cargo(&[
        "clippy",
        "--workspace",
        "--all-targets",
        "--",
        "-D",
        "warnings",
    ])
}

pub(crate) fn test() -> Result<()> {
    cargo(&["test", "--workspace"])
}
