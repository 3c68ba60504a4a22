/// 设备房间命名空间前缀
const NS_DEVICE: &str = "device:";

/// 设备房间名：`device:{id}`
pub fn device_room(device_id: &str) -> String {
    format!("{NS_DEVICE}{device_id}")
}

/// 从房间名解析设备 id，非设备房间或 id 为空时返回 None
pub fn parse_device_room(room: &str) -> Option<&str> {
    room.strip_prefix(NS_DEVICE).filter(|id| !id.is_empty())
}
