//! Formatted output and input over byte-at-a-time primitives.
//!
//! The runtime ships its own formatter because the host's may differ in
//! locale behaviour and must not be used for the program-image format.
//! Output goes through a [`ByteSink`] one byte at a time; input comes from
//! a [`ByteSource`] that reports end-of-input as `None`.

use crate::error::{VmError, VmResult};
use crate::strbuf::Strbuf;

/// Output primitive: receives each emitted byte.
pub trait ByteSink {
    fn put(&mut self, byte: u8) -> VmResult<()>;
}

impl ByteSink for Vec<u8> {
    fn put(&mut self, byte: u8) -> VmResult<()> {
        self.push(byte);
        Ok(())
    }
}

impl ByteSink for Strbuf<'_> {
    fn put(&mut self, byte: u8) -> VmResult<()> {
        self.push(byte);
        Ok(())
    }
}

/// Input primitive: yields bytes until end of input.
pub trait ByteSource {
    fn get(&mut self) -> Option<u8>;
}

/// A byte source over a slice.
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
    peeked: Option<u8>,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            peeked: None,
        }
    }
}

impl ByteSource for SliceSource<'_> {
    fn get(&mut self) -> Option<u8> {
        if let Some(b) = self.peeked.take() {
            return Some(b);
        }
        let b = self.data.get(self.pos).copied();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }
}

/// A formatting argument.
#[derive(Debug, Clone, Copy)]
pub enum FmtArg<'a> {
    Int(i64),
    Uint(u64),
    Float(f64),
    Char(char),
    Str(&'a str),
    Ptr(usize),
}

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    left: bool,
    zero: bool,
    alt: bool,
    width: usize,
    precision: Option<usize>,
}

fn emit(sink: &mut dyn ByteSink, bytes: &[u8], written: &mut usize) -> VmResult<()> {
    for b in bytes {
        sink.put(*b)?;
        *written += 1;
    }
    Ok(())
}

fn pad(
    sink: &mut dyn ByteSink,
    body: &[u8],
    flags: Flags,
    written: &mut usize,
) -> VmResult<()> {
    let padding = flags.width.saturating_sub(body.len());
    if flags.left {
        emit(sink, body, written)?;
        emit(sink, &vec![b' '; padding], written)
    } else if flags.zero && flags.precision.is_none() {
        // sign and prefix must precede zero padding
        let split = body
            .iter()
            .position(|b| b.is_ascii_digit() || *b == b'.')
            .unwrap_or(0);
        emit(sink, &body[..split], written)?;
        emit(sink, &vec![b'0'; padding], written)?;
        emit(sink, &body[split..], written)
    } else {
        emit(sink, &vec![b' '; padding], written)?;
        emit(sink, body, written)
    }
}

fn int_body(value: i64, flags: Flags) -> Vec<u8> {
    let digits = value.unsigned_abs().to_string();
    let mut body = String::new();
    if value < 0 {
        body.push('-');
    }
    if let Some(p) = flags.precision {
        for _ in digits.len()..p {
            body.push('0');
        }
    }
    body.push_str(&digits);
    body.into_bytes()
}

fn uint_body(value: u64, radix: u32, upper: bool, flags: Flags) -> Vec<u8> {
    let mut digits = match radix {
        8 => format!("{value:o}"),
        16 if upper => format!("{value:X}"),
        16 => format!("{value:x}"),
        _ => value.to_string(),
    };
    if let Some(p) = flags.precision {
        while digits.len() < p {
            digits.insert(0, '0');
        }
    }
    let mut body = String::new();
    if flags.alt && value != 0 {
        match radix {
            8 => body.push('0'),
            16 => body.push_str(if upper { "0X" } else { "0x" }),
            _ => {}
        }
    }
    body.push_str(&digits);
    body.into_bytes()
}

fn fixed_body(value: f64, precision: usize) -> Vec<u8> {
    format!("{value:.precision$}").into_bytes()
}

fn exp_body(value: f64, precision: usize, upper: bool) -> Vec<u8> {
    // Rust's exponent formatting omits the sign and zero padding C uses
    let raw = format!("{value:.precision$e}");
    let (mantissa, exp) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    let (sign, digits) = match exp.strip_prefix('-') {
        Some(d) => ('-', d),
        None => ('+', exp),
    };
    let e = if upper { 'E' } else { 'e' };
    format!("{mantissa}{e}{sign}{digits:0>2}").into_bytes()
}

fn general_body(value: f64, precision: usize, flags: Flags) -> Vec<u8> {
    let p = precision.max(1);
    if value == 0.0 {
        return b"0".to_vec();
    }
    let exp = value.abs().log10().floor() as i32;
    let mut body = if exp < -4 || exp >= p as i32 {
        String::from_utf8(exp_body(value, p - 1, false)).expect("ascii")
    } else {
        let decimals = (p as i32 - 1 - exp).max(0) as usize;
        String::from_utf8(fixed_body(value, decimals)).expect("ascii")
    };
    if !flags.alt && body.contains('.') {
        // strip trailing zeros, then a trailing point
        if let Some(epos) = body.find(['e', 'E']) {
            let (mantissa, exponent) = body.split_at(epos);
            let trimmed = mantissa.trim_end_matches('0').trim_end_matches('.');
            body = format!("{trimmed}{exponent}");
        } else {
            body = body
                .trim_end_matches('0')
                .trim_end_matches('.')
                .to_string();
        }
    }
    body.into_bytes()
}

/// Formats `spec` with `args` into `sink`, returning the number of bytes
/// emitted. Supports `%d %i %u %x %X %o %c %s %p %e %f %g` with width,
/// precision, left-justification, zero-padding and the alternate form.
pub fn format(sink: &mut dyn ByteSink, spec: &str, args: &[FmtArg<'_>]) -> VmResult<usize> {
    let mut written = 0usize;
    let mut chars = spec.chars().peekable();
    let mut next_arg = 0usize;
    macro_rules! take {
        () => {{
            let arg = args.get(next_arg).copied().ok_or(VmError::Internal)?;
            next_arg += 1;
            arg
        }};
    }
    while let Some(c) = chars.next() {
        if c != '%' {
            let mut buf = [0u8; 4];
            emit(sink, c.encode_utf8(&mut buf).as_bytes(), &mut written)?;
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            emit(sink, b"%", &mut written)?;
            continue;
        }
        let mut flags = Flags::default();
        loop {
            match chars.peek() {
                Some('-') => {
                    flags.left = true;
                    chars.next();
                }
                Some('0') => {
                    flags.zero = true;
                    chars.next();
                }
                Some('#') => {
                    flags.alt = true;
                    chars.next();
                }
                _ => break,
            }
        }
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            flags.width = flags.width * 10 + d as usize;
            chars.next();
        }
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut p = 0usize;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                p = p * 10 + d as usize;
                chars.next();
            }
            flags.precision = Some(p);
        }
        // length modifiers are accepted and ignored; the internal widths
        // are fixed
        while matches!(chars.peek(), Some('l') | Some('h') | Some('z') | Some('j')) {
            chars.next();
        }
        let conv = chars.next().ok_or(VmError::Internal)?;
        let body: Vec<u8> = match conv {
            'd' | 'i' => match take!() {
                FmtArg::Int(v) => int_body(v, flags),
                FmtArg::Uint(v) => int_body(v as i64, flags),
                _ => return Err(VmError::Internal),
            },
            'u' => match take!() {
                FmtArg::Uint(v) => uint_body(v, 10, false, flags),
                FmtArg::Int(v) => uint_body(v as u64, 10, false, flags),
                _ => return Err(VmError::Internal),
            },
            'x' | 'X' => match take!() {
                FmtArg::Uint(v) => uint_body(v, 16, conv == 'X', flags),
                FmtArg::Int(v) => uint_body(v as u64, 16, conv == 'X', flags),
                _ => return Err(VmError::Internal),
            },
            'o' => match take!() {
                FmtArg::Uint(v) => uint_body(v, 8, false, flags),
                FmtArg::Int(v) => uint_body(v as u64, 8, false, flags),
                _ => return Err(VmError::Internal),
            },
            'c' => match take!() {
                FmtArg::Char(c) => {
                    let mut buf = [0u8; 4];
                    c.encode_utf8(&mut buf).as_bytes().to_vec()
                }
                FmtArg::Int(i) => vec![i as u8],
                _ => return Err(VmError::Internal),
            },
            's' => match take!() {
                FmtArg::Str(s) => {
                    let bytes = s.as_bytes();
                    let limit = flags.precision.unwrap_or(bytes.len()).min(bytes.len());
                    bytes[..limit].to_vec()
                }
                _ => return Err(VmError::Internal),
            },
            'p' => match take!() {
                FmtArg::Ptr(p) => format!("0x{p:x}").into_bytes(),
                _ => return Err(VmError::Internal),
            },
            'f' => match take!() {
                FmtArg::Float(v) => fixed_body(v, flags.precision.unwrap_or(6)),
                _ => return Err(VmError::Internal),
            },
            'e' | 'E' => match take!() {
                FmtArg::Float(v) => exp_body(v, flags.precision.unwrap_or(6), conv == 'E'),
                _ => return Err(VmError::Internal),
            },
            'g' | 'G' => match take!() {
                FmtArg::Float(v) => general_body(v, flags.precision.unwrap_or(6), flags),
                _ => return Err(VmError::Internal),
            },
            _ => return Err(VmError::Internal),
        };
        pad(sink, &body, flags, &mut written)?;
    }
    Ok(written)
}

/// Formats into a fresh byte buffer.
pub fn format_to_vec(spec: &str, args: &[FmtArg<'_>]) -> VmResult<Vec<u8>> {
    let mut out = Vec::new();
    format(&mut out, spec, args)?;
    Ok(out)
}

/// Renders a float the way the language displays it: shortest form that
/// round-trips, keeping a decimal point for integral values.
pub fn float_to_string(value: f64) -> String {
    if value.is_nan() {
        "nan".into()
    } else if value.is_infinite() {
        if value < 0.0 {
            "-inf".into()
        } else {
            "inf".into()
        }
    } else {
        format!("{value:?}")
    }
}

/// A value produced by [`scan`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScanItem {
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(Vec<u8>),
    Char(u8),
}

struct Scanner<'a> {
    source: &'a mut dyn ByteSource,
    pending: Option<u8>,
}

impl<'a> Scanner<'a> {
    fn next(&mut self) -> Option<u8> {
        self.pending.take().or_else(|| self.source.get())
    }

    fn put_back(&mut self, byte: u8) {
        self.pending = Some(byte);
    }

    fn skip_spaces(&mut self) {
        while let Some(b) = self.next() {
            if !b.is_ascii_whitespace() {
                self.put_back(b);
                break;
            }
        }
    }

    fn digits(&mut self, radix: u32, signed: bool) -> Option<(bool, u64)> {
        self.skip_spaces();
        let mut negative = false;
        let mut first = self.next()?;
        if signed && (first == b'-' || first == b'+') {
            negative = first == b'-';
            first = self.next()?;
        }
        let mut seen = false;
        let mut value: u64 = 0;
        let mut b = first;
        loop {
            match (b as char).to_digit(radix) {
                Some(d) => {
                    seen = true;
                    value = value.wrapping_mul(radix as u64).wrapping_add(d as u64);
                }
                None => {
                    self.put_back(b);
                    break;
                }
            }
            b = match self.next() {
                Some(n) => n,
                None => break,
            };
        }
        if seen {
            Some((negative, value))
        } else {
            None
        }
    }

    fn float(&mut self) -> Option<f64> {
        self.skip_spaces();
        let mut text = Vec::new();
        while let Some(b) = self.next() {
            let ok = b.is_ascii_digit()
                || b == b'.'
                || b == b'-'
                || b == b'+'
                || b == b'e'
                || b == b'E';
            if ok {
                text.push(b);
            } else {
                self.put_back(b);
                break;
            }
        }
        std::str::from_utf8(&text).ok()?.parse().ok()
    }
}

/// Parses input according to `spec`. Supports `%d %i %u %x %o %c %s` and
/// the float conversions; literal spec characters must match the input,
/// with any whitespace in the spec skipping input whitespace.
pub fn scan(source: &mut dyn ByteSource, spec: &str) -> VmResult<Vec<ScanItem>> {
    let mut scanner = Scanner {
        source,
        pending: None,
    };
    let mut out = Vec::new();
    let mut chars = spec.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_whitespace() {
            scanner.skip_spaces();
            continue;
        }
        if c != '%' {
            match scanner.next() {
                Some(b) if b == c as u8 => continue,
                _ => return Ok(out),
            }
        }
        while matches!(chars.peek(), Some('l') | Some('h') | Some('z') | Some('j')) {
            chars.next();
        }
        let conv = chars.next().ok_or(VmError::Internal)?;
        match conv {
            'd' | 'i' => match scanner.digits(10, true) {
                Some((neg, v)) => {
                    let v = v as i64;
                    out.push(ScanItem::Int(if neg { -v } else { v }));
                }
                None => return Ok(out),
            },
            'u' => match scanner.digits(10, false) {
                Some((_, v)) => out.push(ScanItem::Uint(v)),
                None => return Ok(out),
            },
            'x' | 'X' => match scanner.digits(16, false) {
                Some((_, v)) => out.push(ScanItem::Uint(v)),
                None => return Ok(out),
            },
            'o' => match scanner.digits(8, false) {
                Some((_, v)) => out.push(ScanItem::Uint(v)),
                None => return Ok(out),
            },
            'f' | 'e' | 'g' => match scanner.float() {
                Some(v) => out.push(ScanItem::Float(v)),
                None => return Ok(out),
            },
            'c' => match scanner.next() {
                Some(b) => out.push(ScanItem::Char(b)),
                None => return Ok(out),
            },
            's' => {
                scanner.skip_spaces();
                let mut text = Vec::new();
                while let Some(b) = scanner.next() {
                    if b.is_ascii_whitespace() {
                        scanner.put_back(b);
                        break;
                    }
                    text.push(b);
                }
                if text.is_empty() {
                    return Ok(out);
                }
                out.push(ScanItem::Str(text));
            }
            '%' => match scanner.next() {
                Some(b'%') => continue,
                _ => return Ok(out),
            },
            _ => return Err(VmError::Internal),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(spec: &str, args: &[FmtArg<'_>]) -> String {
        String::from_utf8(format_to_vec(spec, args).unwrap()).unwrap()
    }

    #[test]
    fn test_int_widths() {
        assert_eq!(fmt("%d", &[FmtArg::Int(42)]), "42");
        assert_eq!(fmt("%5d", &[FmtArg::Int(42)]), "   42");
        assert_eq!(fmt("%-5d|", &[FmtArg::Int(42)]), "42   |");
        assert_eq!(fmt("%05d", &[FmtArg::Int(-42)]), "-0042");
        assert_eq!(fmt("%.4d", &[FmtArg::Int(7)]), "0007");
    }

    #[test]
    fn test_radixes() {
        assert_eq!(fmt("%x", &[FmtArg::Uint(255)]), "ff");
        assert_eq!(fmt("%X", &[FmtArg::Uint(255)]), "FF");
        assert_eq!(fmt("%#x", &[FmtArg::Uint(255)]), "0xff");
        assert_eq!(fmt("%o", &[FmtArg::Uint(8)]), "10");
        assert_eq!(fmt("%#o", &[FmtArg::Uint(8)]), "010");
        assert_eq!(fmt("%u", &[FmtArg::Uint(7)]), "7");
    }

    #[test]
    fn test_strings_and_chars() {
        assert_eq!(fmt("%s!", &[FmtArg::Str("hey")]), "hey!");
        assert_eq!(fmt("%.2s", &[FmtArg::Str("hey")]), "he");
        assert_eq!(fmt("%6s", &[FmtArg::Str("hey")]), "   hey");
        assert_eq!(fmt("%c", &[FmtArg::Char('q')]), "q");
        assert_eq!(fmt("a%%b", &[]), "a%b");
    }

    #[test]
    fn test_floats() {
        assert_eq!(fmt("%f", &[FmtArg::Float(1.5)]), "1.500000");
        assert_eq!(fmt("%.2f", &[FmtArg::Float(3.14159)]), "3.14");
        assert_eq!(fmt("%e", &[FmtArg::Float(1.0)]), "1.000000e+00");
        assert_eq!(fmt("%.1e", &[FmtArg::Float(-250.0)]), "-2.5e+02");
        assert_eq!(fmt("%g", &[FmtArg::Float(0.0001)]), "0.0001");
        assert_eq!(fmt("%g", &[FmtArg::Float(100000.0)]), "100000");
        assert_eq!(fmt("%g", &[FmtArg::Float(1e7)]), "1e+07");
    }

    #[test]
    fn test_float_display() {
        assert_eq!(float_to_string(14.0), "14.0");
        assert_eq!(float_to_string(0.5), "0.5");
        assert_eq!(float_to_string(f64::NAN), "nan");
        assert_eq!(float_to_string(f64::INFINITY), "inf");
    }

    #[test]
    fn test_scan_ints_and_strings() {
        let mut src = SliceSource::new(b"  42 -7 ff hello");
        let items = scan(&mut src, "%d %d %x %s").unwrap();
        assert_eq!(
            items,
            vec![
                ScanItem::Int(42),
                ScanItem::Int(-7),
                ScanItem::Uint(255),
                ScanItem::Str(b"hello".to_vec()),
            ]
        );
    }

    #[test]
    fn test_scan_float_and_literal() {
        let mut src = SliceSource::new(b"v=2.5e1;");
        let items = scan(&mut src, "v=%f;").unwrap();
        assert_eq!(items, vec![ScanItem::Float(25.0)]);
    }

    #[test]
    fn test_scan_stops_on_mismatch() {
        let mut src = SliceSource::new(b"12 x");
        let items = scan(&mut src, "%d %d").unwrap();
        assert_eq!(items, vec![ScanItem::Int(12)]);
    }
}
