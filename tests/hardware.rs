//! Tests against a connected printer
//!
//! Ignored by default. Point them at the hardware and run with
//! `--ignored`:
//!
//! - `PRINTER_HIL_USB_PORT`: USB virtual COM port, or `auto`
//! - `PRINTER_HIL_RS232_PORT`: serial port wired to the printer's RS232 input

use printer_hil::core::printer::{ConfigOption, MeasureChannel, Printer};
use printer_hil::core::transport::{HardwarePorts, PortSpec};
use printer_hil::{Interface, LineConfig, TransportManager};

fn manager_for(interface: Interface, var: &str) -> Option<TransportManager> {
    let port = std::env::var(var).ok()?;
    let spec: PortSpec = port.parse().ok()?;
    Some(TransportManager::new(HardwarePorts::new().with_port(interface, spec)))
}

#[tokio::test]
#[ignore = "needs a printer on PRINTER_HIL_USB_PORT"]
async fn usb_measurements_are_plausible() {
    let Some(manager) = manager_for(Interface::Usb, "PRINTER_HIL_USB_PORT") else {
        return;
    };
    let channel = manager.open(Interface::Usb).await.unwrap();
    let printer = Printer::new(&channel);

    let vcc = printer.measure(MeasureChannel::VccVoltage as u8).await.unwrap();
    assert!((3000..=3600).contains(&vcc), "VCC {vcc} mV");
    let font_library = printer.measure(MeasureChannel::FontLibraryValid as u8).await.unwrap();
    assert_eq!(font_library, 1);

    channel.teardown().await;
}

#[tokio::test]
#[ignore = "needs a printer on PRINTER_HIL_RS232_PORT"]
async fn rs232_reads_back_its_line_options() {
    let Some(manager) = manager_for(Interface::Rs232, "PRINTER_HIL_RS232_PORT") else {
        return;
    };
    let channel = manager.open(Interface::Rs232).await.unwrap();
    let printer = Printer::new(&channel);

    let frame = printer.read_option(ConfigOption::DataBitsParity1).await.unwrap();
    let baud = printer.read_option(ConfigOption::BaudRate1).await.unwrap();
    assert_eq!(frame, LineConfig::DEFAULT.frame.option_value());
    assert_eq!(baud, LineConfig::DEFAULT.baud_rate.option_value());

    channel.teardown().await;
}
