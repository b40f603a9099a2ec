pub mod coupon;
pub mod order;
pub mod order_item;
pub mod product;

pub use coupon::CouponKind;
pub use order::{OrderStatus, PaymentMethod, ShippingAddress};
