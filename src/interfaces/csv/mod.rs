pub mod outcome_writer;
pub mod statement_reader;
