// `#[zbus::proxy]` generates `AttendanceProxy` (async); the CLI only uses that one.
#[zbus::proxy(
    interface = "io.rollcall.Attendance1",
    default_service = "io.rollcall.Attendance1",
    default_path = "/io/rollcall/Attendance1"
)]
pub trait Attendance {
    async fn enroll(&self, payload: &str) -> zbus::Result<String>;
    async fn record(&self, payload: &str) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn report(&self, from: &str, to: &str, group: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}
