pub mod offers;
