mod memory_store;

#[cfg(feature = "consul")]
mod consul_store;
