use lkl_host::{LklError, Result};

use std::fmt;

/// Size of the guest command line buffer, terminating NUL included.
pub const COMMAND_LINE_SIZE: usize = 4096;

/// Guest memory size used when the command line has no `mem=` parameter.
pub const DEFAULT_MEM_SIZE: u64 = 32 * 1024 * 1024;

/// Guest command line in its fixed-size boot buffer.
#[derive(Clone)]
pub struct CommandLine {
    buf: Box<[u8; COMMAND_LINE_SIZE]>,
    len: usize,
}

/// `fmt::Write` sink that stops copying at the buffer boundary but keeps counting.
struct BoundedWriter<'a> {
    buf: &'a mut [u8; COMMAND_LINE_SIZE],
    len: usize,
    wanted: usize,
}

impl fmt::Write for BoundedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // Keep the last byte for the terminator.
        let room = (COMMAND_LINE_SIZE - 1).saturating_sub(self.len);
        let n = room.min(s.len());
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        self.wanted += s.len();
        Ok(())
    }
}

impl CommandLine {
    /// Render `args` followed by the host's device enumeration string.
    ///
    /// Fails with [`LklError::ConfigOverflow`] when the result and its terminator do not fit in
    /// [`COMMAND_LINE_SIZE`] bytes.
    pub fn render(args: fmt::Arguments<'_>, devices: Option<&str>) -> Result<Self> {
        let mut buf = Box::new([0u8; COMMAND_LINE_SIZE]);
        let mut w = BoundedWriter {
            buf: &mut *buf,
            len: 0,
            wanted: 0,
        };
        let _ = fmt::write(&mut w, args);
        if let Some(devices) = devices {
            let _ = fmt::Write::write_str(&mut w, devices);
        }

        let (len, wanted) = (w.len, w.wanted);
        if wanted >= COMMAND_LINE_SIZE {
            return Err(LklError::ConfigOverflow {
                len: wanted,
                capacity: COMMAND_LINE_SIZE,
            });
        }
        Ok(Self { buf, len })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The buffer including the NUL terminator and trailing zero fill.
    pub fn raw(&self) -> &[u8; COMMAND_LINE_SIZE] {
        &self.buf
    }

    pub fn as_str(&self) -> &str {
        // Only whole `str` fragments are ever copied in, so this cannot fail.
        std::str::from_utf8(self.as_bytes()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Value of the last `mem=` parameter, or [`DEFAULT_MEM_SIZE`].
    ///
    /// Unparseable values are ignored.
    pub fn mem_size(&self) -> u64 {
        let mut mem_size = DEFAULT_MEM_SIZE;
        for value in self
            .as_str()
            .split_ascii_whitespace()
            .filter_map(|param| param.strip_prefix("mem="))
        {
            match memparse(value) {
                Some(size) => mem_size = size,
                None => tracing::warn!("ignoring malformed early parameter mem={value}"),
            }
        }
        mem_size
    }
}

impl fmt::Debug for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CommandLine").field(&self.as_str()).finish()
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a size with an optional binary suffix (`K`, `M`, `G`, `T`, `P`, `E`, either case).
///
/// The number may be decimal, `0x` hexadecimal or `0` octal. Trailing text after the suffix is
/// ignored. Returns `None` when there are no digits or the value overflows.
pub fn memparse(s: &str) -> Option<u64> {
    let (radix, digits) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
    {
        (16, hex)
    } else if s.len() > 1 && s.starts_with('0') {
        (8, &s[1..])
    } else {
        (10, s)
    };

    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let value = u64::from_str_radix(&digits[..end], radix).ok()?;

    let shift = match digits[end..].chars().next() {
        Some('K' | 'k') => 10,
        Some('M' | 'm') => 20,
        Some('G' | 'g') => 30,
        Some('T' | 't') => 40,
        Some('P' | 'p') => 50,
        Some('E' | 'e') => 60,
        _ => 0,
    };
    value.checked_mul(1u64 << shift)
}

/// Parameters handed to the guest kernel entry point.
#[derive(Debug, Clone)]
pub struct BootParams {
    pub command_line: CommandLine,
    /// Bytes of guest memory, from `mem=`.
    pub mem_size: u64,
}

impl BootParams {
    pub fn new(command_line: CommandLine) -> Self {
        let mem_size = command_line.mem_size();
        Self {
            command_line,
            mem_size,
        }
    }
}
