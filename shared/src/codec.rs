//! Empacotamento big-endian e leitura posicional dos formatos canônicos

use crate::error::CoreError;
use crate::hash::Hash256;
use crate::Result;

/// Anexa um u16 big-endian ao buffer
pub fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Anexa um u32 big-endian ao buffer
pub fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Anexa um u64 big-endian ao buffer
pub fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Anexa bytes prefixados pelo tamanho (u64 big-endian)
pub fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u64(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Cursor de leitura sobre um buffer serializado
///
/// Toda leitura além do fim devolve [`CoreError::Malformed`], nunca entra em
/// pânico; é o único caminho de decodificação de dados vindos da rede.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Lê `n` bytes crus
    ///
    /// # Errors
    ///
    /// Retorna erro se não restarem `n` bytes
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(CoreError::Malformed(format!(
                "esperava {n} bytes, restam {}",
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// # Errors
    ///
    /// Retorna erro em caso de fim prematuro do buffer
    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes(bytes.try_into().expect("2 bytes")))
    }

    /// # Errors
    ///
    /// Retorna erro em caso de fim prematuro do buffer
    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("4 bytes")))
    }

    /// # Errors
    ///
    /// Retorna erro em caso de fim prematuro do buffer
    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().expect("8 bytes")))
    }

    /// Lê um hash de 32 bytes
    ///
    /// # Errors
    ///
    /// Retorna erro em caso de fim prematuro do buffer
    pub fn read_hash(&mut self) -> Result<Hash256> {
        let bytes = self.read_bytes(Hash256::LEN)?;
        Hash256::from_slice(bytes)
    }

    /// Lê bytes prefixados pelo tamanho (u64 big-endian)
    ///
    /// # Errors
    ///
    /// Retorna erro se o tamanho declarado exceder o restante do buffer
    pub fn read_var_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u64()?;
        let len = usize::try_from(len)
            .map_err(|_| CoreError::Malformed("tamanho de campo excede usize".to_string()))?;
        if len > self.remaining() {
            return Err(CoreError::Malformed(format!(
                "campo declara {len} bytes, restam {}",
                self.remaining()
            )));
        }
        self.read_bytes(len)
    }

    /// Confirma que o buffer foi consumido por inteiro
    ///
    /// # Errors
    ///
    /// Retorna erro se sobrarem bytes não lidos
    pub fn expect_end(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(CoreError::Malformed(format!(
                "{} bytes sobrando após decodificação",
                self.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_integers() {
        let mut buf = Vec::new();
        put_u16(&mut buf, 0xBEEF);
        put_u32(&mut buf, 0xDEAD_BEEF);
        put_u64(&mut buf, u64::MAX);

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_u16().unwrap(), 0xBEEF);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_u64().unwrap(), u64::MAX);
        r.expect_end().unwrap();
    }

    #[test]
    fn test_big_endian_layout() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 1);
        assert_eq!(buf, [0, 0, 0, 1]);
    }

    #[test]
    fn test_var_bytes_roundtrip() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, b"veil");
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_var_bytes().unwrap(), b"veil");
    }

    #[test]
    fn test_truncated_input_is_malformed() {
        let mut buf = Vec::new();
        put_u64(&mut buf, 100);
        buf.extend_from_slice(b"curto");

        let mut r = Reader::new(&buf);
        assert!(r.read_var_bytes().is_err());
    }

    #[test]
    fn test_expect_end_catches_trailing_bytes() {
        let buf = [0u8; 3];
        let mut r = Reader::new(&buf);
        let _ = r.read_u16().unwrap();
        assert!(r.expect_end().is_err());
    }
}
