pub mod customer_writer;
