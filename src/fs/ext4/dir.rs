//! ext4 directory records.
//!
//! Directory data is a run of variable-length records, each padded to a
//! 4-byte boundary, with the last record of every block stretched to the
//! block end. Lookup is a linear scan; hashed directory trees are just a
//! lookup accelerator layered over the same records, so scanning stays
//! correct for them too.

/// Fixed part of a directory record preceding the name bytes.
const DIR_RECORD_HEADER: usize = 8;

/// One decoded directory record.
#[derive(Clone, Copy, Debug)]
pub struct DirRecord<'a> {
    /// Inode the record points at; 0 marks an unused slot.
    pub inode: u32,

    /// File-type code (`1` regular, `2` directory) when the volume carries
    /// the `FILETYPE` feature, 0 otherwise.
    pub file_type: u8,

    /// Raw name bytes, no terminator.
    pub name: &'a [u8],
}

/// Iterator over the records of an in-memory directory image.
pub struct DirRecords<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> DirRecords<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }
}

impl<'a> Iterator for DirRecords<'a> {
    type Item = DirRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rest = self.data.get(self.cursor..)?;
            if rest.len() < DIR_RECORD_HEADER {
                return None;
            }

            let inode = u32::from_le_bytes(rest[0..4].try_into().ok()?);
            let rec_len = usize::from(u16::from_le_bytes(rest[4..6].try_into().ok()?));
            let name_len = usize::from(rest[6]);
            let file_type = rest[7];

            // A record shorter than its own header or its name would never
            // have been written by a sane mkfs; stop instead of looping.
            if rec_len < DIR_RECORD_HEADER + name_len || rec_len > rest.len() {
                return None;
            }

            self.cursor += rec_len;

            if inode == 0 {
                continue;
            }

            return Some(DirRecord {
                inode,
                file_type,
                name: &rest[DIR_RECORD_HEADER..DIR_RECORD_HEADER + name_len],
            });
        }
    }
}

/// Finds `name` in a directory image, returning its inode number.
pub fn lookup(data: &[u8], name: &[u8]) -> Option<u32> {
    DirRecords::new(data)
        .find(|record| record.name == name)
        .map(|record| record.inode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    pub(crate) fn record(inode: u32, name: &[u8], rec_len: u16) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&inode.to_le_bytes());
        bytes.extend_from_slice(&rec_len.to_le_bytes());
        bytes.push(name.len() as u8);
        bytes.push(if name.is_empty() { 0 } else { 2 });
        bytes.extend_from_slice(name);
        bytes.resize(usize::from(rec_len), 0);
        bytes
    }

    #[test]
    fn scans_records() {
        let mut image = Vec::new();
        image.extend(record(2, b".", 12));
        image.extend(record(2, b"..", 12));
        image.extend(record(11, b"boot", 40));

        let names: Vec<&[u8]> = DirRecords::new(&image).map(|r| r.name).collect();
        assert_eq!(names, [b".".as_slice(), b"..".as_slice(), b"boot".as_slice()]);
        assert_eq!(lookup(&image, b"boot"), Some(11));
        assert_eq!(lookup(&image, b"missing"), None);
    }

    #[test]
    fn skips_unused_slots() {
        let mut image = Vec::new();
        image.extend(record(0, b"", 16));
        image.extend(record(12, b"vmlinuz", 24));

        assert_eq!(lookup(&image, b"vmlinuz"), Some(12));
    }

    #[test]
    fn stops_on_corrupt_length() {
        let mut image = record(5, b"x", 12);
        // Truncate the record mid-header.
        image.extend([9u8, 0, 0]);

        assert_eq!(DirRecords::new(&image).count(), 1);
    }
}
