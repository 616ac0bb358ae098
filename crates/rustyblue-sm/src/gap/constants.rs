// Address types
pub const PUBLIC_DEVICE_ADDRESS: u8 = 0x00;
pub const RANDOM_DEVICE_ADDRESS: u8 = 0x01;
pub const PUBLIC_IDENTITY_ADDRESS: u8 = 0x02;
pub const RANDOM_IDENTITY_ADDRESS: u8 = 0x03;

// Connection roles as reported by LE Connection Complete
pub const ROLE_CENTRAL: u8 = 0x00;
pub const ROLE_PERIPHERAL: u8 = 0x01;

// Top two bits of the most significant address byte
pub const RANDOM_ADDRESS_STATIC_BITS: u8 = 0xC0;
pub const RANDOM_ADDRESS_RESOLVABLE_BITS: u8 = 0x40;
pub const RANDOM_ADDRESS_NON_RESOLVABLE_BITS: u8 = 0x00;
pub const RANDOM_ADDRESS_TYPE_MASK: u8 = 0xC0;

// Private address rotation, seconds
pub const RANDOM_ADDRESS_UPDATE_PERIOD_DEFAULT: u64 = 15 * 60;
