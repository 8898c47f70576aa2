//! The reference table: nodes that live in other files.
//!
//! Each external node owns the auxiliary slot given by its node index, so body references to it
//! use the same index scheme as references to inline nodes.

use serde::{Deserialize, Serialize};

use crate::cursor::{LengthPrefix, Reader, Writer};
use crate::error::{Error, Result};

const RESOURCE_FLAG: i32 = 4;

// Folder trees deeper than this are treated as corrupt.
const MAX_FOLDER_DEPTH: usize = 32;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefTable {
    /// How many directories up from the file the folder tree is rooted.
    pub ancestor_level: i32,
    pub folders: Vec<RefFolder>,
    pub nodes: Vec<ExternalNode>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefFolder {
    pub name: String,
    pub folders: Vec<RefFolder>,
}

/// Where an external node's file is found.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalFile {
    /// A file name inside one of the table's folders.
    Name { file_name: String, folder_index: i32 },
    /// An index into the game's resource list.
    Resource(i32),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalNode {
    /// Raw flags. Bit 2 is rewritten from `file` on write.
    pub flags: i32,
    pub file: ExternalFile,
    /// Auxiliary slot the node occupies. Body references to it carry `node_index + 1`.
    pub node_index: i32,
    /// Present from version 5.
    pub use_file: Option<bool>,
}

impl RefTable {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn read(r: &mut Reader<'_>, version: i16) -> Result<Self> {
        let count = r.read_count()?;
        if count == 0 {
            return Ok(Self::default());
        }
        let ancestor_level = r.read_i32()?;
        let folders = read_folders(r, 0)?;
        let nodes = r.read_array(count, |r| read_node(r, version))?;
        tracing::debug!(externals = nodes.len(), ancestor_level, "read reference table");
        Ok(Self {
            ancestor_level,
            folders,
            nodes,
        })
    }

    pub(crate) fn write(&self, w: &mut Writer, version: i16) -> Result<()> {
        w.write_count(self.nodes.len())?;
        if self.nodes.is_empty() {
            return Ok(());
        }
        w.write_i32(self.ancestor_level);
        write_folders(w, &self.folders)?;
        for node in &self.nodes {
            write_node(w, node, version)?;
        }
        Ok(())
    }
}

fn read_folders(r: &mut Reader<'_>, depth: usize) -> Result<Vec<RefFolder>> {
    if depth > MAX_FOLDER_DEPTH {
        return Err(Error::malformed(r.offset(), "reference folder tree too deep"));
    }
    let count = r.read_count()?;
    r.read_array(count, |r| {
        Ok(RefFolder {
            name: r.read_string(LengthPrefix::I32)?,
            folders: read_folders(r, depth + 1)?,
        })
    })
}

fn write_folders(w: &mut Writer, folders: &[RefFolder]) -> Result<()> {
    w.write_count(folders.len())?;
    for folder in folders {
        w.write_str(&folder.name, LengthPrefix::I32)?;
        write_folders(w, &folder.folders)?;
    }
    Ok(())
}

fn read_node(r: &mut Reader<'_>, version: i16) -> Result<ExternalNode> {
    let flags = r.read_i32()?;
    let resource = flags & RESOURCE_FLAG != 0;
    let (file_name, resource_index) = if resource {
        (None, r.read_i32()?)
    } else {
        (Some(r.read_string(LengthPrefix::I32)?), 0)
    };
    let node_index = r.read_i32()?;
    let use_file = if version >= 5 {
        Some(r.read_bool()?)
    } else {
        None
    };
    let file = match file_name {
        Some(file_name) => ExternalFile::Name {
            file_name,
            folder_index: r.read_i32()?,
        },
        None => ExternalFile::Resource(resource_index),
    };
    Ok(ExternalNode {
        flags,
        file,
        node_index,
        use_file,
    })
}

fn write_node(w: &mut Writer, node: &ExternalNode, version: i16) -> Result<()> {
    let flags = match node.file {
        ExternalFile::Name { .. } => node.flags & !RESOURCE_FLAG,
        ExternalFile::Resource(_) => node.flags | RESOURCE_FLAG,
    };
    w.write_i32(flags);
    match &node.file {
        ExternalFile::Name { file_name, .. } => w.write_str(file_name, LengthPrefix::I32)?,
        ExternalFile::Resource(index) => w.write_i32(*index),
    }
    w.write_i32(node.node_index);
    if version >= 5 {
        w.write_bool(node.use_file.unwrap_or(false));
    }
    if let ExternalFile::Name { folder_index, .. } = &node.file {
        w.write_i32(*folder_index);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RefTable {
        RefTable {
            ancestor_level: 2,
            folders: vec![RefFolder {
                name: "Blocks".into(),
                folders: vec![RefFolder {
                    name: "Stadium".into(),
                    folders: vec![],
                }],
            }],
            nodes: vec![
                ExternalNode {
                    flags: 1,
                    file: ExternalFile::Name {
                        file_name: "Road.Block.Gbx".into(),
                        folder_index: 2,
                    },
                    node_index: 3,
                    use_file: Some(true),
                },
                ExternalNode {
                    flags: RESOURCE_FLAG,
                    file: ExternalFile::Resource(17),
                    node_index: 5,
                    use_file: Some(false),
                },
            ],
        }
    }

    #[test]
    fn layout() {
        let mut w = Writer::new();
        sample().write(&mut w, 6).unwrap();
        let data = w.into_inner();
        let mut r = Reader::new(&data);
        assert_eq!(r.read_i32().unwrap(), 2);
        assert_eq!(r.read_i32().unwrap(), 2);
        assert_eq!(r.read_i32().unwrap(), 1);
        assert_eq!(r.read_str(LengthPrefix::I32).unwrap(), "Blocks");
        assert_eq!(r.read_i32().unwrap(), 1);
        assert_eq!(r.read_str(LengthPrefix::I32).unwrap(), "Stadium");
        assert_eq!(r.read_i32().unwrap(), 0);
        // First node: flags, name, index, use-file, folder.
        assert_eq!(r.read_i32().unwrap(), 1);
        assert_eq!(r.read_str(LengthPrefix::I32).unwrap(), "Road.Block.Gbx");
        assert_eq!(r.read_i32().unwrap(), 3);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_i32().unwrap(), 2);
        // Second node: flags, resource, index, use-file.
        assert_eq!(r.read_i32().unwrap(), RESOURCE_FLAG);
        assert_eq!(r.read_i32().unwrap(), 17);
        assert_eq!(r.read_i32().unwrap(), 5);
        assert!(!r.read_bool().unwrap());
        assert!(r.is_empty());

        assert_eq!(RefTable::read(&mut Reader::new(&data), 6).unwrap(), sample());
    }

    #[test]
    fn use_file_needs_version_5() {
        let mut w = Writer::new();
        sample().write(&mut w, 4).unwrap();
        let v4 = w.into_inner();
        let mut w = Writer::new();
        sample().write(&mut w, 5).unwrap();
        assert_eq!(w.len(), v4.len() + 8);

        let read = RefTable::read(&mut Reader::new(&v4), 4).unwrap();
        assert!(read.nodes.iter().all(|n| n.use_file.is_none()));
    }

    #[test]
    fn empty_table_is_one_count() {
        let mut w = Writer::new();
        RefTable::default().write(&mut w, 6).unwrap();
        assert_eq!(w.as_slice(), &[0, 0, 0, 0]);
        assert!(RefTable::read(&mut Reader::new(w.as_slice()), 6)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn deep_folder_trees_are_rejected() {
        let mut w = Writer::new();
        w.write_i32(1);
        w.write_i32(0);
        for _ in 0..=MAX_FOLDER_DEPTH + 1 {
            w.write_i32(1);
            w.write_str("d", LengthPrefix::I32).unwrap();
        }
        let data = w.into_inner();
        assert!(matches!(
            RefTable::read(&mut Reader::new(&data), 6),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn resource_flag_follows_file_kind() {
        let mut table = sample();
        table.nodes[1].flags = 0;
        let mut w = Writer::new();
        table.write(&mut w, 6).unwrap();
        let read = RefTable::read(&mut Reader::new(w.as_slice()), 6).unwrap();
        assert_eq!(read.nodes[1].flags, RESOURCE_FLAG);
        assert_eq!(read.nodes[1].file, ExternalFile::Resource(17));
    }
}
