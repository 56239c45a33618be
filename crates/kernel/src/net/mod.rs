// Network layer: socket file objects.
//
// Only the loopback datagram path is wired up; stream sockets require a
// NIC collaborator and report failure while none is registered.

pub mod socket;
