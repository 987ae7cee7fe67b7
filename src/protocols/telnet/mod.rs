pub mod codes;
pub mod gmcp;
pub mod mccp;
pub mod mssp;
pub mod stream;
pub mod telopt;
pub mod terminal;
