pub mod repairs;
