// Address types
pub const PUBLIC_DEVICE_ADDRESS: u8 = 0x00;
pub const RANDOM_DEVICE_ADDRESS: u8 = 0x01;
pub const PUBLIC_IDENTITY_ADDRESS: u8 = 0x02;
pub const RANDOM_IDENTITY_ADDRESS: u8 = 0x03;

// Random address sub-types, taken from the two most significant bits
pub const RANDOM_ADDRESS_TYPE_MASK: u8 = 0xC0;
pub const RANDOM_ADDRESS_NON_RESOLVABLE: u8 = 0x00;
pub const RANDOM_ADDRESS_RESOLVABLE: u8 = 0x40;
pub const RANDOM_ADDRESS_STATIC: u8 = 0xC0;

// Device types
pub const DEVICE_TYPE_BREDR: u8 = 0x01;
pub const DEVICE_TYPE_LE: u8 = 0x02;
pub const DEVICE_TYPE_DUMO: u8 = 0x03;

// LE connection parameter ranges
pub const LE_CONN_INTERVAL_MIN: u16 = 0x0006; // 7.5 ms
pub const LE_CONN_INTERVAL_MAX: u16 = 0x0C80; // 4 s
pub const LE_CONN_LATENCY_MAX: u16 = 0x01F3; // 499
pub const LE_SUPERVISION_TIMEOUT_MIN: u16 = 0x000A; // 100 ms
pub const LE_SUPERVISION_TIMEOUT_MAX: u16 = 0x0C80; // 32 s
pub const LE_CONN_PARAM_UNDEF: u16 = 0xFFFF;
pub const LE_CONN_LATENCY_DEFAULT: u16 = 0x0000;
pub const LE_SUPERVISION_TIMEOUT_DEFAULT: u16 = 2000; // 20 s
