use uuid::Uuid;

/**
 * Advertised name of the sensor firmware.
 */
pub const DEFAULT_DEVICE_NAME: &str = "Arduino_GCS";

/**
 * Advertised name used by the Nano 33 BLE builds of the firmware.
 */
pub const NANO_DEVICE_NAME: &str = "Nano33BLE";

/**
 * The UUID of the custom BLE service carrying the heading.
 */
pub const ANGLE_SERVICE: &str = "12345678-1234-5678-1234-56789abcdef0";

/**
 * The UUID of the BLE characteristic that notifies the heading.
 */
pub const ANGLE_CHARACTERISTIC: &str = "12345678-1234-5678-1234-56789abcdef1";

pub const ANGLE_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef0);
pub const ANGLE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef1);

/**
 * Standard Device Information service and the characteristics some firmware builds reuse.
 */
pub const DEVICE_INFORMATION_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
pub const DIGITAL_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x00002a57_0000_1000_8000_00805f9b34fb);
pub const BATTERY_LEVEL_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/**
 * Client Characteristic Configuration Descriptor; writing it enables notifications.
 */
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/**
 * How long (milliseconds) to wait after connecting before discovering services.
 */
pub const DISCOVERY_GRACE: u64 = 1000;

/**
 * How long (milliseconds) a scan may run without finding the peripheral.
 */
pub const SCAN_TIMEOUT: u64 = 10_000;

/**
 * How long (milliseconds) to wait before scanning again after losing the peripheral.
 */
pub const RESCAN_DELAY: u64 = 5000;

/**
 * How often (milliseconds) the firmware pushes a new heading.
 */
pub const NOTIFY_INTERVAL: u64 = 500;

/**
 * Degrees the firmware advances the heading on every push.
 */
pub const ANGLE_STEP: i32 = 10;

/**
 * Capacity of the channels feeding the link task.
 */
pub const CHANNEL_CAPACITY: usize = 64;
