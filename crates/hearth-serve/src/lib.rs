// ABOUTME: hearth-serve library: the connection broker in front of the pool
// ABOUTME: Exposes run() for the hearthd binary

pub mod server;

pub use server::run;
