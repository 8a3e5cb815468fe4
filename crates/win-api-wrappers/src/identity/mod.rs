pub mod sid;
