//! eBUS symbols, data types and message catalog
//!
//! The protocol independent parts of the eBUS stack: addresses and CRC,
//! the master/slave frame types, the field data types, message
//! definitions with their last-value cache, and the CSV definition
//! reader.

#![deny(rust_2018_idioms)]
#![deny(rust_2021_compatibility)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod data;
pub mod datatype;
mod error;
pub mod filereader;
mod manufacturer;
pub mod message;
pub mod symbol;

pub use crate::{
    data::{Field, FieldList, FieldTemplates, PartType, FIELD_SEPARATOR},
    datatype::{DataType, DataTypeList, NumberType, OutputFormat},
    error::Error,
    filereader::{extract_defaults_from_filename, FilenameDefaults, LoadResult},
    manufacturer::{manufacturer_name, Manufacturer},
    message::{
        frame_key, now_secs, Condition, Direction, FindOptions, Instruction, Message,
        MessageCatalog,
    },
    symbol::{
        crc8, is_master, is_valid_address, master_address, master_number, slave_address,
        MasterFrame, SlaveFrame, ACK, BROADCAST, ESC, MAX_DATA_LEN, NAK, SYN,
    },
};

pub type Result<T> = std::result::Result<T, Error>;
