//! Aggregates module
pub mod product;
pub mod order;
pub mod cart;

pub use product::{Product, ProductError};
pub use order::{Order, OrderDetails, OrderError, OrderItem, OrderStatus, PaymentMethod, ShippingAddress, VendorOrder};
pub use cart::{Cart, CartItem, CartLine};
