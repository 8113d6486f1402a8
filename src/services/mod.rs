pub mod entities;
pub mod intake;
pub mod mapper;
pub mod mappers;
pub mod parser;
pub mod progress;
pub mod queue;
pub mod recovery;
pub mod storage;
pub mod worker;
