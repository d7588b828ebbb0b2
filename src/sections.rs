//! ELF section-bounds resolution (spec §4.A).
//!
//! Parses an ELF file and returns the `[start, end)` virtual-address range
//! of the first section whose name *contains* a given substring. The driver
//! uses this to restrict coverage reduction to a single code region.

use std::fs;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SectionError {
    #[error("failed to read {0}: {1}")]
    Io(std::path::PathBuf, std::io::Error),
    #[error("{0} is not an ELF file")]
    NotElf(std::path::PathBuf),
    #[error("failed to parse ELF headers: {0}")]
    Parse(#[from] goblin::error::Error),
    #[error("no section name contains {needle:?} in {path}")]
    NotFound {
        path: std::path::PathBuf,
        needle: String,
    },
}

/// Half-open `[start, end)` virtual-address range of a resolved section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionBounds {
    pub start: u64,
    pub end: u64,
}

impl SectionBounds {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr <= self.end
    }
}

/// Finds the first section whose name contains `needle`, returning its
/// address bounds. Fails with `SectionError::NotFound` if the binary is a
/// well-formed ELF with no matching section (the original's "size == 0"
/// case, fatal at startup per spec §4.A/§9).
pub fn find(binary_path: &Path, needle: &str) -> Result<SectionBounds, SectionError> {
    let bytes = fs::read(binary_path)
        .map_err(|e| SectionError::Io(binary_path.to_path_buf(), e))?;

    if goblin::elf::header::parse(&bytes, 0).is_err() {
        return Err(SectionError::NotElf(binary_path.to_path_buf()));
    }

    let elf = goblin::elf::Elf::parse(&bytes)?;

    for section in &elf.section_headers {
        let name = elf
            .shdr_strtab
            .get_at(section.sh_name)
            .unwrap_or("");
        if name.contains(needle) {
            return Ok(SectionBounds {
                start: section.sh_addr,
                end: section.sh_addr + section.sh_size,
            });
        }
    }

    Err(SectionError::NotFound {
        path: binary_path.to_path_buf(),
        needle: needle.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_is_inclusive_both_ends() {
        let b = SectionBounds {
            start: 0x1000,
            end: 0x2000,
        };
        assert!(b.contains(0x1000));
        assert!(b.contains(0x2000));
        assert!(b.contains(0x1800));
        assert!(!b.contains(0xFFF));
        assert!(!b.contains(0x2001));
    }

    #[test]
    fn rejects_non_elf_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-an-elf");
        std::fs::write(&path, b"this is not an ELF file at all").unwrap();

        let err = find(&path, "text").unwrap_err();
        assert!(matches!(err, SectionError::NotElf(_)));
    }

    #[test]
    fn no_matching_section_is_not_found_error() {
        let self_exe = std::env::current_exe().unwrap();
        let err = find(&self_exe, "no-such-section-name-zzzz").unwrap_err();
        assert!(matches!(err, SectionError::NotFound { .. }));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = find(Path::new("/no/such/binary-xyz"), "text").unwrap_err();
        assert!(matches!(err, SectionError::Io(_, _)));
    }
}
