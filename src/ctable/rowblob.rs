//! Packed row-blob formats.
//!
//! A row of columns nests inside a single blob, so a whole row travels
//! through the dtable stack as one value. Two layouts:
//!
//! [`SubBlob`] — named columns, linear list:
//!
//! ```text
//! byte 0:        length size L (1–4)
//! per column:    value length (L bytes LE) | name length u8 | name | value bytes
//! ```
//!
//! [`IndexBlob`] — a fixed column count, directory plus packed bytes:
//!
//! ```text
//! per column:    size u32 (u32::MAX = absent)
//! then:          concatenated value bytes in column order
//! ```
//!
//! Both parse lazily into an edit form, mutate in memory, and flatten back
//! once per row write.

use crate::{ctable::CtableError, value::Blob};

/// Smallest byte width that can hold `max`.
fn length_size(max: usize) -> usize {
    match max {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

fn read_le(bytes: &[u8]) -> usize {
    let mut value = 0usize;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= (byte as usize) << (8 * i);
    }
    value
}

fn write_le(value: usize, width: usize, out: &mut Vec<u8>) {
    for i in 0..width {
        out.push(((value >> (8 * i)) & 0xFF) as u8);
    }
}

// ------------------------------------------------------------------------------------------------
// SubBlob
// ------------------------------------------------------------------------------------------------

/// Named-column row in edit form. Absent columns are simply missing;
/// setting a dne value removes a column.
#[derive(Debug, Default)]
pub struct SubBlob {
    columns: Vec<(String, Blob)>,
}

impl SubBlob {
    /// An empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a packed row; a dne or empty blob is an empty row.
    pub fn from_blob(base: &Blob) -> Result<Self, CtableError> {
        let bytes = base.bytes();
        if bytes.is_empty() {
            return Ok(Self::new());
        }
        let length_size = bytes[0] as usize;
        if !(1..=4).contains(&length_size) {
            return Err(CtableError::CorruptRow(format!(
                "bad length size {length_size}"
            )));
        }
        let mut columns = Vec::new();
        let mut offset = 1;
        while offset + length_size + 1 <= bytes.len() {
            let value_len = read_le(&bytes[offset..offset + length_size]);
            offset += length_size;
            let name_len = bytes[offset] as usize;
            offset += 1;
            if offset + name_len + value_len > bytes.len() {
                return Err(CtableError::CorruptRow("column runs past row".into()));
            }
            let name = std::str::from_utf8(&bytes[offset..offset + name_len])
                .map_err(|_| CtableError::CorruptRow("column name not UTF-8".into()))?
                .to_string();
            offset += name_len;
            let value = Blob::from(&bytes[offset..offset + value_len]);
            offset += value_len;
            columns.push((name, value));
        }
        Ok(Self { columns })
    }

    /// Extracts one column from a packed row without building the edit
    /// form.
    pub fn extract(base: &Blob, column: &str) -> Result<Option<Blob>, CtableError> {
        let bytes = base.bytes();
        if bytes.is_empty() {
            return Ok(None);
        }
        let length_size = bytes[0] as usize;
        if !(1..=4).contains(&length_size) {
            return Err(CtableError::CorruptRow(format!(
                "bad length size {length_size}"
            )));
        }
        let mut offset = 1;
        while offset + length_size + 1 <= bytes.len() {
            let value_len = read_le(&bytes[offset..offset + length_size]);
            offset += length_size;
            let name_len = bytes[offset] as usize;
            offset += 1;
            if offset + name_len + value_len > bytes.len() {
                return Err(CtableError::CorruptRow("column runs past row".into()));
            }
            let name = &bytes[offset..offset + name_len];
            offset += name_len;
            if name == column.as_bytes() {
                return Ok(Some(Blob::from(&bytes[offset..offset + value_len])));
            }
            offset += value_len;
        }
        Ok(None)
    }

    /// Value of `column`, if present.
    pub fn get(&self, column: &str) -> Option<Blob> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.clone())
    }

    /// Sets `column`; a dne value removes it. Names are capped at 255
    /// bytes by the format.
    pub fn set(&mut self, column: &str, value: Blob) -> Result<(), CtableError> {
        if column.len() > 0xFF {
            return Err(CtableError::InvalidArgument(
                "column names are limited to 255 bytes".into(),
            ));
        }
        if let Some(slot) = self.columns.iter_mut().find(|(name, _)| name == column) {
            slot.1 = value;
            return Ok(());
        }
        if value.exists() {
            self.columns.push((column.to_string(), value));
        }
        Ok(())
    }

    /// Removes `column`.
    pub fn remove(&mut self, column: &str) -> Result<(), CtableError> {
        self.set(column, Blob::dne())
    }

    /// Whether no column is present.
    pub fn is_empty(&self) -> bool {
        self.columns.iter().all(|(_, value)| !value.exists())
    }

    /// Present (name, value) pairs in stored order.
    pub fn present(&self) -> impl Iterator<Item = (&str, &Blob)> {
        self.columns
            .iter()
            .filter(|(_, value)| value.exists())
            .map(|(name, value)| (name.as_str(), value))
    }

    /// Packs the row back into a blob.
    pub fn flatten(&self) -> Blob {
        let max_len = self
            .present()
            .map(|(_, value)| value.size())
            .max()
            .unwrap_or(0);
        let length_size = length_size(max_len);
        let mut out = Vec::new();
        out.push(length_size as u8);
        for (name, value) in self.present() {
            write_le(value.size(), length_size, &mut out);
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(value.bytes());
        }
        Blob::from(out)
    }
}

// ------------------------------------------------------------------------------------------------
// IndexBlob
// ------------------------------------------------------------------------------------------------

/// Absent-column marker in the size directory.
const ABSENT: u32 = u32::MAX;

/// Fixed-count indexed row in edit form.
#[derive(Debug)]
pub struct IndexBlob {
    columns: Vec<Blob>,
}

impl IndexBlob {
    /// An empty row of `count` absent columns.
    pub fn new(count: usize) -> Self {
        Self {
            columns: vec![Blob::dne(); count],
        }
    }

    /// Parses a packed row of `count` columns; a dne or empty blob is an
    /// all-absent row.
    pub fn from_blob(base: &Blob, count: usize) -> Result<Self, CtableError> {
        let bytes = base.bytes();
        if bytes.is_empty() {
            return Ok(Self::new(count));
        }
        if bytes.len() < count * 4 {
            return Err(CtableError::CorruptRow("row shorter than directory".into()));
        }
        let mut columns = Vec::with_capacity(count);
        let mut offset = count * 4;
        for index in 0..count {
            let size = u32::from_le_bytes(
                bytes[index * 4..index * 4 + 4].try_into().unwrap_or([0; 4]),
            );
            if size == ABSENT {
                columns.push(Blob::dne());
                continue;
            }
            let size = size as usize;
            if offset + size > bytes.len() {
                return Err(CtableError::CorruptRow("column runs past row".into()));
            }
            columns.push(Blob::from(&bytes[offset..offset + size]));
            offset += size;
        }
        Ok(Self { columns })
    }

    /// Number of column slots.
    pub fn count(&self) -> usize {
        self.columns.len()
    }

    /// Value at `index`, if present.
    pub fn get(&self, index: usize) -> Option<Blob> {
        self.columns
            .get(index)
            .filter(|value| value.exists())
            .cloned()
    }

    /// Sets slot `index` (dne = absent).
    pub fn set(&mut self, index: usize, value: Blob) -> Result<(), CtableError> {
        let slot = self
            .columns
            .get_mut(index)
            .ok_or_else(|| CtableError::NoColumn(format!("index {index}")))?;
        *slot = value;
        Ok(())
    }

    /// Whether no column is present.
    pub fn is_empty(&self) -> bool {
        self.columns.iter().all(|value| !value.exists())
    }

    /// Packs the row back into a blob.
    pub fn flatten(&self) -> Blob {
        let mut out = Vec::with_capacity(self.columns.len() * 4);
        for value in &self.columns {
            if value.exists() {
                out.extend_from_slice(&(value.size() as u32).to_le_bytes());
            } else {
                out.extend_from_slice(&ABSENT.to_le_bytes());
            }
        }
        for value in &self.columns {
            out.extend_from_slice(value.bytes());
        }
        Blob::from(out)
    }
}
