pub mod contract;
pub mod page;
pub mod recommendation;
pub mod run;
