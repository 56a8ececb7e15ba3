pub(crate) mod logging;

pub(crate) mod mem_db;

pub(crate) mod network;

pub(crate) mod node;

pub(crate) mod registry;

pub(crate) mod streams;
