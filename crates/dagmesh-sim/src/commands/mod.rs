pub mod check;
pub mod db;
pub mod run;
