pub mod cell;
pub mod change_record;
