#![no_std]
#![no_main]

use alphaess_core::error::BringupFailure;
use alphaess_core::{BUF_MAX_SIZE, Credentials, PollError, PollPolicy, Session, TargetEndpoint};
use defmt::*;
use embassy_executor::Spawner;
use embassy_net::StackResources;
use embassy_net::udp::PacketMetadata;
use embassy_net_wiznet::chip::W5500;
use embassy_net_wiznet::{Device, Runner, State};
use embassy_rp::clocks::RoscRng;
use embassy_rp::gpio::{Input, Level, Output, Pull};
use embassy_rp::peripherals::SPI0;
use embassy_rp::spi::{Async, Config as SpiConfig, Spi};
use embassy_time::Delay;
use embedded_hal_bus::spi::ExclusiveDevice;
use rand::RngCore;
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

mod net;

use net::{EmbassyClock, SntpUdp, StackInterface, TcpTransport};

/// Firmware version string injected by build.rs.
pub const FW_VERSION: &str = env!("POLLER_FW_VERSION");

pub const APP_ID: &str = env!("ALPHAESS_APP_ID");
pub const APP_SECRET: &str = env!("ALPHAESS_APP_SECRET");
pub const SYS_SN: &str = env!("ALPHAESS_SYS_SN");

pub const POLLER_MAC: Option<&str> = option_env!("POLLER_MAC");
pub const POLLER_STATIC_IP: Option<&str> = option_env!("POLLER_STATIC_IP");
pub const POLLER_NETMASK: Option<&str> = option_env!("POLLER_NETMASK");
pub const POLLER_GATEWAY: Option<&str> = option_env!("POLLER_GATEWAY");
pub const POLLER_DNS: Option<&str> = option_env!("POLLER_DNS");

const SPI_FREQUENCY_HZ: u32 = 50_000_000;

type W5500Spi = ExclusiveDevice<Spi<'static, SPI0, Async>, Output<'static>, Delay>;

static WIZNET_STATE: StaticCell<State<8, 8>> = StaticCell::new();
// DHCP, DNS, SNTP and one TCP socket.
static NET_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();
static SESSION: StaticCell<Session<'static, EmbassyClock>> = StaticCell::new();

#[embassy_executor::task]
async fn ethernet_task(
    runner: Runner<'static, W5500, W5500Spi, Input<'static>, Output<'static>>,
) -> ! {
    runner.run().await
}

#[embassy_executor::task]
async fn net_task(mut runner: embassy_net::Runner<'static, Device<'static>>) -> ! {
    runner.run().await
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_rp::init(Default::default());
    info!("{=str}", FW_VERSION);

    let net_cfg = net::network_config_from_env();
    let Some(endpoint) = TargetEndpoint::last_power_data(SYS_SN) else {
        error!("ALPHAESS_SYS_SN does not fit the request path");
        halt().await
    };
    info!("appId {=str}, sysSn {=str}", APP_ID, SYS_SN);

    // W5500 on SPI0: SCK 18, MOSI 19, MISO 16, CS 17, RST 20, INT 21.
    let mut spi_cfg = SpiConfig::default();
    spi_cfg.frequency = SPI_FREQUENCY_HZ;
    let (miso, mosi, clk) = (p.PIN_16, p.PIN_19, p.PIN_18);
    let spi = Spi::new(p.SPI0, clk, mosi, miso, p.DMA_CH0, p.DMA_CH1, spi_cfg);
    let cs = Output::new(p.PIN_17, Level::High);
    let w5500_int = Input::new(p.PIN_21, Pull::Up);
    let w5500_reset = Output::new(p.PIN_20, Level::High);
    let Ok(spi_dev) = ExclusiveDevice::new(spi, cs, Delay);

    let state = WIZNET_STATE.init(State::<8, 8>::new());
    let (device, runner) =
        match embassy_net_wiznet::new(net_cfg.mac, state, spi_dev, w5500_int, w5500_reset).await {
            Ok(parts) => parts,
            Err(_) => {
                report(PollError::Bringup(BringupFailure::ChipNotResponding));
                halt().await
            }
        };
    unwrap!(spawner.spawn(ethernet_task(runner)));
    info!("W5500 initialized");

    let seed = RoscRng.next_u64();
    let (stack, runner) = embassy_net::new(
        device,
        net::stack_config(&net_cfg),
        NET_RESOURCES.init(StackResources::new()),
        seed,
    );
    unwrap!(spawner.spawn(net_task(runner)));

    let session = SESSION.init(Session::new(
        net_cfg,
        endpoint,
        Credentials::new(APP_ID, APP_SECRET),
        PollPolicy::DEFAULT,
        EmbassyClock,
    ));

    let mut iface = StackInterface::new(stack);

    let mut sntp_rx_meta = [PacketMetadata::EMPTY; 2];
    let mut sntp_rx = [0u8; 128];
    let mut sntp_tx_meta = [PacketMetadata::EMPTY; 2];
    let mut sntp_tx = [0u8; 128];
    let mut sntp = match SntpUdp::new(
        stack,
        &mut sntp_rx_meta,
        &mut sntp_rx,
        &mut sntp_tx_meta,
        &mut sntp_tx,
    ) {
        Ok(sock) => sock,
        Err(e) => {
            error!("SNTP socket bind failed: {:?}", e);
            halt().await
        }
    };

    let mut tcp_rx = [0u8; BUF_MAX_SIZE];
    let mut tcp_tx = [0u8; BUF_MAX_SIZE];
    let mut tcp = TcpTransport::new(stack, &mut tcp_rx, &mut tcp_tx);

    match session.run(&mut iface, &mut sntp, &mut tcp).await {
        Ok(resp) => {
            info!("response: {} bytes, status {}", resp.len, resp.status);
            info!("==============================");
            info!("{=[u8]:a}", session.response());
            info!("==============================");
        }
        Err(e) => report(e),
    }

    halt().await
}

fn report(e: PollError) {
    error!("{} failed: {}", e.phase(), e);
}

/// Park the orchestration; the runner tasks keep the stack alive.
async fn halt() -> ! {
    loop {
        core::future::pending::<()>().await;
    }
}
