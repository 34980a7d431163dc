pub mod sim_bus;
pub mod test_node;
pub mod utils;
