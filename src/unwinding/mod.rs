pub mod function_calls;
pub mod return_addresses;
pub mod unwinder;
pub mod visitor;
