use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Status error: {0}")]
    Status(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(u64),

    #[error("Inexistent key: {0}")]
    InexistentKey(u64),

    #[error("Inexistent column: {0}")]
    InexistentColumn(String),

    #[error("Duplicate collection: {0}")]
    DuplicateCollection(String),

    #[error("Invalid index data format: {0}")]
    InvalidIndexDataFormat(String),

    #[error("Invalid segment: {0}")]
    InvalidSegment(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Mismatched schema: {0}")]
    MismatchedSchema(String),

    #[error("Column name field can not be updated")]
    UpdateColumnNameField,

    #[error("Index type field can not be updated")]
    UpdateIndexTypeField,

    #[error("Data type field can not be updated")]
    UpdateDataTypeField,

    #[error("Parameters field can not be updated")]
    UpdateParametersField,

    #[error("Repository type field can not be updated")]
    UpdateRepositoryTypeField,

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Read data failed: {0}")]
    ReadData(String),

    #[error("Write data failed: {0}")]
    WriteData(String),

    #[error("Exceed limit: {0}")]
    ExceedLimit(String),

    #[error("Unpack index failed: {0}")]
    UnpackIndex(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
