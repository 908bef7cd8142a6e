use log::debug;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchitectureError {
    #[error("expected bits must be 32 or 64, got {0}")]
    InvalidExpectation(u32),
    #[error("{program:?} reports \"{reported}\", runner expects {expected}-bit")]
    Mismatch {
        program: PathBuf,
        reported: String,
        expected: u32,
    },
    #[error("failed to inspect {program:?}: {source}")]
    Probe {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Reports the native word width of an executable as a string such as
/// `"64bit"`.
pub trait WordWidthProbe {
    fn word_width(&self, program: &Path) -> Result<String, ArchitectureError>;
}

/// Checks that `program` was built for `expected_bits`.
///
/// The comparison is a prefix match on the probe's report, so `"32bit"` and
/// `"32-bit"` both satisfy 32. Expectations other than 32 or 64 are rejected
/// before the probe runs.
pub fn verify<P: WordWidthProbe + ?Sized>(
    probe: &P,
    program: &Path,
    expected_bits: u32,
) -> Result<(), ArchitectureError> {
    if expected_bits != 32 && expected_bits != 64 {
        return Err(ArchitectureError::InvalidExpectation(expected_bits));
    }
    let reported = probe.word_width(program)?;
    debug!("{program:?} word width: {reported}");
    if reported.starts_with(&expected_bits.to_string()) {
        Ok(())
    } else {
        Err(ArchitectureError::Mismatch {
            program: program.to_path_buf(),
            reported,
            expected: expected_bits,
        })
    }
}

/// Word width of the running build, in bits.
pub fn host_bits() -> u32 {
    usize::BITS
}

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const PE_OPTIONAL_MAGIC_32: u16 = 0x10b;
const PE_OPTIONAL_MAGIC_64: u16 = 0x20b;

/// Reads the executable header of ELF, PE and Mach-O files.
///
/// Files in any other format (scripts, for instance) report the width of the
/// running build.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderProbe;

impl HeaderProbe {
    fn bits_of(file: &mut File) -> io::Result<Option<u32>> {
        let mut head = [0u8; 64];
        let n = read_up_to(file, &mut head)?;
        let head = &head[..n];

        if head.len() >= 5 && head[..4] == ELF_MAGIC {
            return Ok(match head[4] {
                1 => Some(32),
                2 => Some(64),
                _ => None,
            });
        }
        if head.len() >= 4 {
            let magic = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
            match magic {
                0xfeed_face | 0xcefa_edfe => return Ok(Some(32)),
                0xfeed_facf | 0xcffa_edfe => return Ok(Some(64)),
                _ => {}
            }
        }
        if head.len() >= 0x40 && head[..2] == *b"MZ" {
            let pe_offset =
                u32::from_le_bytes([head[0x3c], head[0x3d], head[0x3e], head[0x3f]]) as u64;
            let mut pe = [0u8; 26];
            file.seek(SeekFrom::Start(pe_offset))?;
            if read_up_to(file, &mut pe)? == pe.len() && pe[..4] == *b"PE\0\0" {
                // Optional header follows the 4-byte signature and 20-byte COFF header.
                return Ok(match u16::from_le_bytes([pe[24], pe[25]]) {
                    PE_OPTIONAL_MAGIC_32 => Some(32),
                    PE_OPTIONAL_MAGIC_64 => Some(64),
                    _ => None,
                });
            }
        }
        Ok(None)
    }
}

impl WordWidthProbe for HeaderProbe {
    fn word_width(&self, program: &Path) -> Result<String, ArchitectureError> {
        let probe_err = |source| ArchitectureError::Probe {
            program: program.to_path_buf(),
            source,
        };
        let mut file = File::open(program).map_err(probe_err)?;
        let bits = match Self::bits_of(&mut file).map_err(probe_err)? {
            Some(bits) => bits,
            None => {
                debug!("{program:?} has no recognised header, assuming host width");
                host_bits()
            }
        };
        Ok(format!("{bits}bit"))
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
