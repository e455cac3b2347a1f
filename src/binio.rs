//! Little-endian scalar helpers for the binary model format.

use std::io::{Read, Write};

use crate::error::{Error, Result};

pub fn write_i32<W: Write>(out: &mut W, v: i32) -> Result<()> {
    out.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn write_u32<W: Write>(out: &mut W, v: u32) -> Result<()> {
    out.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn write_i64<W: Write>(out: &mut W, v: i64) -> Result<()> {
    out.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn write_u16<W: Write>(out: &mut W, v: u16) -> Result<()> {
    out.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn write_u8<W: Write>(out: &mut W, v: u8) -> Result<()> {
    out.write_all(&[v])?;
    Ok(())
}

pub fn write_f64<W: Write>(out: &mut W, v: f64) -> Result<()> {
    out.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn write_bool<W: Write>(out: &mut W, v: bool) -> Result<()> {
    write_u8(out, v as u8)
}

/// NUL-terminated byte string, as the dictionary stores entry words.
pub fn write_cstr<W: Write>(out: &mut W, s: &str) -> Result<()> {
    out.write_all(s.as_bytes())?;
    out.write_all(&[0])?;
    Ok(())
}

pub fn read_i32<R: Read>(inp: &mut R) -> Result<i32> {
    let mut b = [0u8; 4];
    inp.read_exact(&mut b)?;
    Ok(i32::from_le_bytes(b))
}

pub fn read_u32<R: Read>(inp: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    inp.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

pub fn read_i64<R: Read>(inp: &mut R) -> Result<i64> {
    let mut b = [0u8; 8];
    inp.read_exact(&mut b)?;
    Ok(i64::from_le_bytes(b))
}

pub fn read_u16<R: Read>(inp: &mut R) -> Result<u16> {
    let mut b = [0u8; 2];
    inp.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

pub fn read_u8<R: Read>(inp: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    inp.read_exact(&mut b)?;
    Ok(b[0])
}

pub fn read_f64<R: Read>(inp: &mut R) -> Result<f64> {
    let mut b = [0u8; 8];
    inp.read_exact(&mut b)?;
    Ok(f64::from_le_bytes(b))
}

pub fn read_bool<R: Read>(inp: &mut R) -> Result<bool> {
    Ok(read_u8(inp)? != 0)
}

pub fn read_cstr<R: Read>(inp: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let b = read_u8(inp)?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8(bytes).map_err(|e| Error::format(format!("invalid utf-8 in word: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn scalar_round_trip() {
        let mut buf = Vec::new();
        write_i32(&mut buf, -7).unwrap();
        write_i64(&mut buf, 1 << 40).unwrap();
        write_u16(&mut buf, 513).unwrap();
        write_f64(&mut buf, 0.25).unwrap();
        write_bool(&mut buf, true).unwrap();
        write_cstr(&mut buf, "дом").unwrap();

        let mut c = Cursor::new(buf);
        assert_eq!(read_i32(&mut c).unwrap(), -7);
        assert_eq!(read_i64(&mut c).unwrap(), 1 << 40);
        assert_eq!(read_u16(&mut c).unwrap(), 513);
        assert_eq!(read_f64(&mut c).unwrap(), 0.25);
        assert!(read_bool(&mut c).unwrap());
        assert_eq!(read_cstr(&mut c).unwrap(), "дом");
    }
}
