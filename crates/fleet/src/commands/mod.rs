pub mod config;
pub mod restore;
pub mod server;
pub mod snapshot;
pub mod stack;
pub mod volume;

use fleet_orchestration::Association;

/// One line per server: fqdn, id and address
pub fn print_servers(servers: &[Association]) {
    for association in servers {
        let address = association.server.address().unwrap_or("-");
        println!("{:<40} {:<20} {}", association.fqdn, association.id(), address);
    }
}
