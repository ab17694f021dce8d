pub mod ns16550a;
